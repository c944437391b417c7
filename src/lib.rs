//! Matter secure messaging and reliable transport core
//!
//! This library implements the session and reliability layer of the Matter protocol on top of
//! UDP. Library uses asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [Transport](transport::Transport) - Representation of IP/UDP transport. Binds to specified IP/port,
//!                             allows to define virtual connections for remote destinations
//!                             and demultiplexes incoming messages based on these connections.
//!                             Implements [MessageSender](transport::MessageSender), the node-id
//!                             addressed send seam the managers below are built against.
//! - [SecureSessionTable](session::SecureSessionTable) - Fixed pool of AES-128-CCM encrypted sessions
//!                              with collision-free local session id allocation. Each
//!                              [SecureSession](session::SecureSession) encodes and decodes
//!                              whole frames including header authentication.
//! - [ReliableMessageMgr](reliable::ReliableMessageMgr) - Per-exchange acknowledgement state and the shared
//!                              retransmission table. Every reliable message is retransmitted with
//!                              exponential backoff until acknowledged or given up on.
//! - [MessageCounterManager](counter_sync::MessageCounterManager) - Challenge/response message counter
//!                              synchronization, holding traffic to and from a peer until its
//!                              counter is known.
//! - [ActiveResolveAttempts](resolve::ActiveResolveAttempts) - Bounded address resolution retry
//!                              schedule with doubling backoff.
//! - [timer](timer) - Injected clock and single-shot timer service driving all of the above, so
//!                              tests can advance time by hand.
//!
//! Example how to wire a reliable sender over UDP:
//! ```no_run
//! # use std::sync::Arc;
//! # use anyhow::Result;
//! # use matms::{reliable, timer, transport};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let device_id = 300;
//! let transport = transport::Transport::new("0.0.0.0:5555").await?;
//! transport.register_peer(device_id, "1.2.3.4:5540".parse()?);
//! let (timers, _fired) = timer::TimerService::new();
//! let clock: Arc<dyn timer::Clock> = Arc::new(timer::SystemClock);
//! let sender: Arc<dyn transport::MessageSender> = transport.clone();
//! let mut mgr = reliable::ReliableMessageMgr::new(clock, sender, timers);
//! mgr.alloc_context(1, device_id)?;
//! // encoded frames go out through the manager so they are tracked for
//! // retransmission; fired timer keys are fed back via on_timer
//! # Ok(())
//! # }
//! ```

pub mod counter_sync;
pub mod error;
pub mod messages;
pub mod reliable;
pub mod resolve;
pub mod retransmit;
pub mod session;
pub mod timer;
pub mod transport;

pub use error::Error;
