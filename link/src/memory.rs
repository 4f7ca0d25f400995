//! In-process connector
//!
//! [`MemoryConnector`] hands out links whose remote end is driven through a
//! [`MemoryRemote`] handle: inject frames, observe what the client sent,
//! drop the link or refuse connects.

use crate::{frame, Connector, InboundFrame, Link, LinkError, OutboundFrame};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct RemoteState {
    inbound: Option<mpsc::Sender<Result<InboundFrame, LinkError>>>,
    session: u64,
    sent: Vec<OutboundFrame>,
    connects: u32,
    fail_next: u32,
    refuse: bool,
    auto_pong: bool,
    auto_ack: bool,
}

/// Connector backed by in-memory channels
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<RemoteState>>,
}

/// Remote end of a [`MemoryConnector`]
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryConnector {
    /// Create connector plus its remote handle. Pings are answered automatically.
    pub fn new() -> (Self, MemoryRemote) {
        let state = Arc::new(Mutex::new(RemoteState {
            auto_pong: true,
            ..Default::default()
        }));

        (Self { state: state.clone() }, MemoryRemote { state })
    }
}

impl Connector for MemoryConnector {
    fn endpoint(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>> {
        Box::pin(async move {
            let (link, mut outbound_rx, inbound_tx) = Link::pair();

            let session = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.connects += 1;

                if state.refuse {
                    return Err(LinkError::ConnectFailed("memory remote refused".to_string()));
                }
                if state.fail_next > 0 {
                    state.fail_next -= 1;
                    return Err(LinkError::ConnectFailed("memory remote unavailable".to_string()));
                }

                state.session += 1;
                state.inbound = Some(inbound_tx);
                state.session
            };

            // Remote side: log every frame, answer pings and emergency alerts.
            // Replies go through the shared sender so `drop_link` closes the client side.
            let state = self.state.clone();
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let reply = {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        let current = state.session == session;
                        let reply = match &frame {
                            OutboundFrame::Ping { nonce } if state.auto_pong => {
                                Some(InboundFrame::Pong { nonce: *nonce })
                            }
                            OutboundFrame::EmergencyAlert { alert_id, .. } if state.auto_ack => {
                                Some(InboundFrame::EmergencyAck { alert_id: alert_id.clone() })
                            }
                            _ => None,
                        };
                        state.sent.push(frame);
                        if current {
                            reply.zip(state.inbound.clone())
                        } else {
                            None
                        }
                    };

                    if let Some((reply, tx)) = reply {
                        if tx.send(Ok(reply)).await.is_err() {
                            break;
                        }
                    }
                }
            });

            Ok(link)
        })
    }
}

impl MemoryRemote {
    fn with_state<R>(&self, f: impl FnOnce(&mut RemoteState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Deliver a frame to the client
    pub async fn push(&self, frame: InboundFrame) -> Result<(), LinkError> {
        self.push_result(Ok(frame)).await
    }

    /// Deliver raw text to the client through the frame decoder
    pub async fn push_raw(&self, line: &str) -> Result<(), LinkError> {
        self.push_result(frame::decode(line)).await
    }

    async fn push_result(&self, item: Result<InboundFrame, LinkError>) -> Result<(), LinkError> {
        let tx = self.with_state(|s| s.inbound.clone()).ok_or(LinkError::Closed)?;
        tx.send(item).await.map_err(|_| LinkError::Closed)
    }

    /// Close the current link from the remote side
    pub fn drop_link(&self) {
        self.with_state(|s| s.inbound = None);
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.with_state(|s| s.fail_next = n);
    }

    /// Refuse every connect until cleared
    pub fn set_refuse(&self, refuse: bool) {
        self.with_state(|s| s.refuse = refuse);
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.with_state(|s| s.auto_pong = enabled);
    }

    /// Acknowledge emergency alerts as soon as they arrive
    pub fn set_auto_ack(&self, enabled: bool) {
        self.with_state(|s| s.auto_ack = enabled);
    }

    /// Number of connect attempts seen, successful or not
    pub fn connect_count(&self) -> u32 {
        self.with_state(|s| s.connects)
    }

    pub fn is_linked(&self) -> bool {
        self.with_state(|s| s.inbound.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false))
    }

    /// Every frame the client has sent so far
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.with_state(|s| s.sent.clone())
    }

    /// Sent frames of one kind, e.g. `"ping"`
    pub fn sent_of_kind(&self, kind: &str) -> Vec<OutboundFrame> {
        self.with_state(|s| s.sent.iter().filter(|f| f.kind() == kind).cloned().collect())
    }
}
