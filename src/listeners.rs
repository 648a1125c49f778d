//! Host signal intake.
//!
//! The engine does not watch the host itself. A host feeds focus and
//! connectivity changes in, either by calling [`Api::on_focus`] and friends
//! directly, or by handing a stream of [`HostSignal`]s to
//! [`setup_listeners`].
//!
//! # Example
//!
//! ```
//! use cloudburst::prelude::*;
//! use cloudburst::listeners::{HostSignal, signal_port};
//! use cloudburst::transport::dummy_base_query;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let api = Api::builder(dummy_base_query()).refetch_on_focus(true).build();
//! let (signals, listener) = signal_port(&api);
//!
//! // Somewhere in the host's event loop:
//! signals.send(HostSignal::FocusLost).ok();
//! signals.send(HostSignal::Focus).ok();
//!
//! listener.cancel().await;
//! # }
//! ```

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::api::Api;

/// A change in the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSignal {
    Focus,
    FocusLost,
    Online,
    Offline,
}

impl Api {
    /// Forwards one host signal.
    pub fn on_host_signal(&self, signal: HostSignal) {
        match signal {
            HostSignal::Focus => self.on_focus(),
            HostSignal::FocusLost => self.on_focus_lost(),
            HostSignal::Online => self.on_online(),
            HostSignal::Offline => self.on_offline(),
        }
    }
}

/// Handle for a running listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop listening and wait for the task to finish.
    pub async fn cancel(self) {
        self.token.cancel();
        let _ = self.join.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Feeds every signal of `signals` into `api` until the stream ends, the
/// handle is cancelled, or the API is dropped.
///
/// # Panics
///
/// Must be called within a Tokio runtime.
pub fn setup_listeners<S>(api: &Api, signals: S) -> ListenerHandle
where
    S: Stream<Item = HostSignal> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak = Arc::downgrade(&api.inner);

    let join = tokio::spawn(async move {
        let mut signals = std::pin::pin!(signals);
        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                signal = signals.next() => {
                    let Some(signal) = signal else {
                        break;
                    };
                    let Some(api) = Api::upgrade(&weak) else {
                        break;
                    };
                    tracing::debug!(?signal, "Host signal");
                    api.on_host_signal(signal);
                }
            }
        }
        tracing::debug!("Host signal listener stopped");
    });

    ListenerHandle { token, join }
}

/// Creates a channel whose sent signals are fed into `api`.
///
/// # Panics
///
/// Must be called within a Tokio runtime.
pub fn signal_port(api: &Api) -> (mpsc::UnboundedSender<HostSignal>, ListenerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = setup_listeners(api, UnboundedReceiverStream::new(rx));
    (tx, handle)
}
