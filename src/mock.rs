//! Scriptable transport for tests.
//!
//! `MockTransport` is cheap to clone and every clone shares the same script
//! and call log, so a test can keep one clone while the API owns another:
//!
//! ```
//! use cloudburst::mock::MockTransport;
//! use serde_json::json;
//!
//! let mock = MockTransport::new(|args| Ok(json!({ "id": args["id"] })));
//! let transport = mock.clone(); // hand this one to `Api::builder`
//! # drop(transport);
//! assert_eq!(mock.call_count(), 0);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::QueryError;
use crate::transport::{BaseQuery, BaseQueryApi, QueryReturnValue};

type Responder = Arc<dyn Fn(&Value) -> QueryReturnValue + Send + Sync>;

/// A transport answering from a closure, recording every call.
#[derive(Clone)]
pub struct MockTransport {
    responder: Arc<Mutex<Responder>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<Value>>>,
    failures: Arc<Mutex<VecDeque<QueryError>>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("delay", &self.delay)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Creates a transport answering every call with `responder(args)`.
    pub fn new(responder: impl Fn(&Value) -> QueryReturnValue + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(Mutex::new(Arc::new(responder))),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Delays every response. A cancelled call settles with
    /// [`QueryError::Aborted`] as soon as its signal fires.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replaces the responder for subsequent calls.
    pub fn set_responder(&self, responder: impl Fn(&Value) -> QueryReturnValue + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Makes the next `count` calls fail with `error` before the responder is consulted.
    pub fn fail_next(&self, count: usize, error: QueryError) {
        self.failures
            .lock()
            .extend(std::iter::repeat_n(error, count));
    }

    /// Number of calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Arguments of every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }
}

impl BaseQuery for MockTransport {
    fn call(&self, args: Value, api: BaseQueryApi) -> BoxFuture<'static, QueryReturnValue> {
        self.calls.lock().push(args.clone());
        let failure = self.failures.lock().pop_front();
        let responder = Arc::clone(&*self.responder.lock());
        let delay = self.delay;

        async move {
            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    () = api.signal().cancelled() => return Err(QueryError::Aborted),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            match failure {
                Some(error) => Err(error),
                None => responder(&args),
            }
        }
        .boxed()
    }
}
