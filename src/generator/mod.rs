//! Prompt in, phrase out.
//!
//! A [`Generator`] runs each request on its own background thread and hands
//! the result back through the [`MainContext`]. Background threads never touch
//! generator state directly: the continuation runs on the main context and
//! first checks the shared validity flag, which the generator clears when it
//! is dropped.

mod response;
mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use tracing::{debug, error, info, warn};

pub use response::{DEFAULT_ENDPOINT, DEFAULT_MODEL, INSTRUCTIONS, extract_output_text, request_body};
pub use transport::{
    DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, HttpRequest, HttpResponse, Transport, TransportError,
    UreqTransport,
};

use crate::error::GenerateError;
use crate::main_context::MainContext;
use crate::store::SequenceStore;

/// Shared between a generator and every fetch it has in flight.
pub struct SharedState {
    valid: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(true),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

pub struct Generator {
    api_key: Option<String>,
    endpoint: String,
    model: String,
    transport: Arc<dyn Transport>,
    main: MainContext,
    store: Arc<SequenceStore>,
    busy: Arc<AtomicBool>,
    shared: Arc<SharedState>,
}

impl Generator {
    pub fn new(
        api_key: Option<String>,
        transport: Arc<dyn Transport>,
        main: MainContext,
        store: Arc<SequenceStore>,
    ) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            transport,
            main,
            store,
            busy: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(SharedState::new()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    /// Advisory: set when a request is dispatched, cleared by its
    /// continuation.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<SequenceStore> {
        &self.store
    }

    /// Requests a new phrase for `prompt`.
    ///
    /// Without a credential `on_complete` runs immediately on the calling
    /// thread. Otherwise it runs later on the main context, after the store
    /// has been updated. `Ok` carries the raw response body.
    ///
    /// Overlapping calls are not rejected; use [`Generator::try_generate`]
    /// for that.
    pub fn generate<F>(&self, prompt: &str, on_complete: F)
    where
        F: FnOnce(Result<String, GenerateError>) + Send + 'static,
    {
        let Some(api_key) = self.api_key.clone() else {
            warn!("generation requested without an API key");
            on_complete(Err(GenerateError::CredentialMissing));
            return;
        };

        self.busy.store(true, Ordering::Release);
        self.dispatch(prompt, api_key, on_complete);
    }

    /// Like [`Generator::generate`], but refuses to start while another
    /// request from this generator is in flight.
    pub fn try_generate<F>(&self, prompt: &str, on_complete: F) -> Result<(), GenerateError>
    where
        F: FnOnce(Result<String, GenerateError>) + Send + 'static,
    {
        let Some(api_key) = self.api_key.clone() else {
            warn!("generation requested without an API key");
            on_complete(Err(GenerateError::CredentialMissing));
            return Ok(());
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("generation already in flight");
            return Err(GenerateError::Busy);
        }

        self.dispatch(prompt, api_key, on_complete);
        Ok(())
    }

    fn dispatch<F>(&self, prompt: &str, api_key: String, on_complete: F)
    where
        F: FnOnce(Result<String, GenerateError>) + Send + 'static,
    {
        let request = HttpRequest {
            url: self.endpoint.clone(),
            bearer_token: api_key,
            body: request_body(&self.model, prompt),
        };

        let transport = self.transport.clone();
        let main = self.main.clone();
        let shared = self.shared.clone();
        let busy = self.busy.clone();
        let store = self.store.clone();

        info!(endpoint = %request.url, "requesting sequence");

        // Shared with the fetch thread so the callback survives a failed spawn.
        let slot = Arc::new(Mutex::new(Some(on_complete)));
        let thread_slot = slot.clone();

        let spawned = std::thread::Builder::new()
            .name("kiwi-fetch".into())
            .spawn(move || {
                let outcome = transport.post_json(&request);
                let Some(on_complete) = thread_slot.lock().take() else {
                    return;
                };
                main.call_async(move || {
                    let result = classify(outcome);
                    if shared.is_valid() {
                        busy.store(false, Ordering::Release);
                        if let Ok(body) = &result {
                            apply_response(&store, body);
                        }
                    } else {
                        debug!("generator dropped before its request finished; discarding result");
                    }
                    on_complete(result);
                });
            });

        if let Err(e) = spawned {
            if let Some(on_complete) = slot.lock().take() {
                self.fail_dispatch(e, on_complete);
            }
        }
    }

    /// Reports a fetch that never started through the usual continuation path.
    fn fail_dispatch<F>(&self, e: std::io::Error, on_complete: F)
    where
        F: FnOnce(Result<String, GenerateError>) + Send + 'static,
    {
        error!("failed to spawn fetch thread: {e}");
        self.busy.store(false, Ordering::Release);
        let reason = e.to_string();
        self.main.call_async(move || {
            on_complete(Err(GenerateError::ConnectionFailed { status: 0, reason }));
        });
    }

    #[cfg(test)]
    fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.shared.invalidate();
    }
}

fn classify(outcome: Result<HttpResponse, TransportError>) -> Result<String, GenerateError> {
    match outcome {
        Ok(response) if response.is_success() => Ok(response.body),
        Ok(response) => {
            warn!(status = response.status, "generation request rejected");
            Err(GenerateError::ServerError {
                status: response.status,
                body: response.body,
            })
        }
        Err(TransportError::Connection { status, reason }) => {
            warn!(status, %reason, "generation request failed to connect");
            Err(GenerateError::ConnectionFailed { status, reason })
        }
    }
}

/// A successful response without extractable text leaves an empty phrase.
fn apply_response(store: &SequenceStore, raw: &str) {
    match extract_output_text(raw) {
        Some(content) => {
            store.set_content(&content);
        }
        None => {
            warn!("response carried no sequence content");
            store.clear();
        }
    }
}
