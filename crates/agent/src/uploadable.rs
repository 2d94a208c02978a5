//! The AutoUploadable feature: backend operation dispatch and status
//! publishing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use uplift_protocol::{
    ActivateParams, AutoUploadState, CancelParams, Envelope, StartParams, TriggerParams,
    UploadRequest, UploadStatus, AUTO_UPLOAD_PROPERTY, FILE_PATH_OPTION, LAST_UPLOAD_PROPERTY,
    OPTIONS_PREFIX, SUPPORTED_PROVIDERS,
};
use uplift_uploads::{
    EventsQueue, PeriodicExecutor, Task, UploadPolicy, UploadStatusListener, Uploads,
};

use crate::config::UploadableConfig;

/// Capacity of the outbound status-event queue.
const STATUS_EVENTS_CAPACITY: usize = 100;

/// Outcome of a failed feature operation, mapped onto the reply status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("error response [code={status}, msg={message}]")]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl ErrorResponse {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }
}

/// Customizes AutoUploadable behavior.
pub trait UploadCustomizer: Send + Sync + 'static {
    /// Starts file uploads for a `trigger` operation, invoked from the
    /// backend or from the periodic executor.
    fn do_trigger(
        &self,
        correlation_id: &str,
        options: &HashMap<String, String>,
    ) -> Result<(), ErrorResponse>;

    /// Handles operations unknown to the base feature.
    fn handle_operation(&self, operation: &str, payload: &Value) -> ErrorResponse;

    /// Periodic-executor tick.
    fn on_tick(&self);
}

/// Outbound half of the twin connection.
///
/// Implementations must not block; publish failures are absorbed and logged,
/// the next state change reasserts the value.
pub trait TwinChannel: Send + Sync + 'static {
    fn publish(&self, envelope: Envelope);
}

/// The AutoUploadable feature implementation. Performs all communication
/// with the backend; the attached [`UploadCustomizer`] selects the files.
pub struct AutoUploadable {
    device_id: String,
    cfg: UploadableConfig,
    info: HashMap<String, String>,

    state: Mutex<AutoUploadState>,
    uid_counter: AtomicI64,

    status_events: EventsQueue<UploadStatus>,
    uploads: Uploads,
    executor: Mutex<Option<PeriodicExecutor>>,

    customizer: OnceLock<Weak<dyn UploadCustomizer>>,
    channel: Arc<dyn TwinChannel>,
}

impl AutoUploadable {
    pub fn new(device_id: &str, cfg: UploadableConfig, channel: Arc<dyn TwinChannel>) -> Arc<Self> {
        let state = AutoUploadState {
            active: cfg.active,
            start_time: cfg.active_from,
            end_time: cfg.active_till,
        };

        Arc::new(Self {
            device_id: device_id.to_string(),
            info: HashMap::from([(
                "supportedProviders".to_string(),
                SUPPORTED_PROVIDERS.to_string(),
            )]),
            state: Mutex::new(state),
            uid_counter: AtomicI64::new(Utc::now().timestamp()),
            status_events: EventsQueue::new(STATUS_EVENTS_CAPACITY),
            uploads: Uploads::new(),
            executor: Mutex::new(None),
            customizer: OnceLock::new(),
            channel,
            cfg,
        })
    }

    /// Binds the customizer. Must be called once, before the first inbound
    /// operation.
    pub fn set_customizer(&self, customizer: Weak<dyn UploadCustomizer>) {
        let _ = self.customizer.set(customizer);
    }

    pub fn config(&self) -> &UploadableConfig {
        &self.cfg
    }

    /// Whether an aggregate upload is currently transferring.
    pub fn has_pending_uploads(&self) -> bool {
        self.uploads.has_pending()
    }

    /// Announces the feature and starts the status-event consumer.
    pub fn connect(self: &Arc<Self>) {
        let channel = Arc::clone(&self.channel);
        let device_id = self.device_id.clone();
        let feature = self.cfg.name.clone();
        self.status_events.start(move |status: UploadStatus| {
            match serde_json::to_value(&status) {
                Ok(value) => channel.publish(Envelope::property_modify(
                    &device_id,
                    &feature,
                    LAST_UPLOAD_PROPERTY,
                    value,
                )),
                Err(e) => error!("could not serialize upload status: {e}"),
            }
        });

        let state = *self.state.lock().unwrap();
        self.channel.publish(Envelope::feature_modify(
            &self.device_id,
            &self.cfg.name,
            json!({
                "properties": {
                    "type": self.cfg.feature_type,
                    "context": self.cfg.context,
                    "info": self.info,
                    "autoUpload": state,
                }
            }),
        ));

        if self.cfg.active {
            self.start_executor();
        }
    }

    /// Stops the event consumer, the periodic executor and pending uploads,
    /// in that order.
    pub async fn disconnect(&self) {
        self.status_events.stop();
        self.stop_executor();
        self.uploads.stop(self.cfg.stop_timeout.duration()).await;
    }

    /// Entry point for an inbound operation envelope. Returns the reply to
    /// publish, or `None` when the message is not addressed to this feature.
    pub fn handle_envelope(self: &Arc<Self>, envelope: &Envelope) -> Option<Envelope> {
        let feature_prefix = format!("/features/{}", self.cfg.name);
        if !envelope.path.starts_with(&feature_prefix) {
            return None;
        }

        let (namespace, name) = self
            .device_id
            .split_once(':')
            .unwrap_or(("", self.device_id.as_str()));
        if !envelope.topic.starts_with(&format!("{namespace}/{name}/")) {
            return None;
        }

        info!(path = %envelope.path, topic = %envelope.topic, "message received");

        let operation_prefix = format!("/features/{}/inbox/messages/", self.cfg.name);
        let Some(operation) = envelope.path.strip_prefix(&operation_prefix) else {
            warn!(topic = %envelope.topic, "ignoring unsupported message");
            return None;
        };

        let payload = envelope.value.clone().unwrap_or(Value::Null);
        let result = match operation {
            "start" => self.start(&payload),
            "trigger" => self.trigger(&payload),
            "cancel" => self.cancel(&payload),
            "activate" => self.activate(&payload),
            "deactivate" => self.deactivate(&payload),
            other => Err(match self.customizer() {
                Some(customizer) => customizer.handle_operation(other, &payload),
                None => ErrorResponse::internal("no operation handler attached"),
            }),
        };

        Some(match result {
            Ok(()) => envelope.reply(204, None),
            Err(e) => {
                error!(operation, "error while executing operation: {}", e.message);
                envelope.reply(e.status, Some(Value::String(e.message)))
            }
        })
    }

    /// Starts the upload of the given files by sending one upload request
    /// per file with the specified correlation id and options.
    pub fn upload_files(
        self: &Arc<Self>,
        correlation_id: &str,
        files: &[PathBuf],
        options: &HashMap<String, String>,
    ) {
        let policy = UploadPolicy {
            delete_uploaded: self.cfg.delete,
            use_checksum: self.cfg.checksum,
            server_cert: (!self.cfg.server_cert.is_empty())
                .then(|| self.cfg.server_cert.clone()),
        };

        let listener: Arc<dyn UploadStatusListener> = Arc::clone(self) as Arc<dyn UploadStatusListener>;
        let child_ids = self
            .uploads
            .add_multi(correlation_id, files, policy, listener);

        for (index, child_id) in child_ids.iter().enumerate() {
            let mut request_options =
                uplift_uploaders::extract_dictionary(options, OPTIONS_PREFIX);
            request_options.insert("storage.providers".to_string(), "aws, azure, generic".to_string());
            request_options.insert(
                FILE_PATH_OPTION.to_string(),
                files[index].display().to_string(),
            );

            self.send_upload_request(child_id, request_options, &files[index]);
        }
    }

    /// Publishes a feature-property modify for the given value.
    pub fn update_property(&self, name: &str, value: Value) {
        self.channel.publish(Envelope::property_modify(
            &self.device_id,
            &self.cfg.name,
            name,
            value,
        ));
        info!(property = name, "feature property value updated");
    }

    /// Generates the next correlation id for internally triggered uploads.
    pub fn next_uid(&self) -> String {
        let uid = self.uid_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("upload-id-{uid}")
    }

    // -- feature operations -------------------------------------------------

    fn trigger(self: &Arc<Self>, payload: &Value) -> Result<(), ErrorResponse> {
        let params: TriggerParams = parse_params(payload, "trigger")?;
        info!(?params, "trigger called");

        let correlation_id = if params.correlation_id.is_empty() {
            self.next_uid()
        } else {
            params.correlation_id.clone()
        };

        let customizer = self
            .customizer()
            .ok_or_else(|| ErrorResponse::internal("no trigger handler attached"))?;
        customizer.do_trigger(&correlation_id, &params.options)
    }

    fn start(&self, payload: &Value) -> Result<(), ErrorResponse> {
        let params: StartParams = parse_params(payload, "start")?;
        info!(correlation_id = %params.correlation_id, "start called");

        let Some(upload) = self.uploads.get(&params.correlation_id) else {
            return Err(ErrorResponse::not_found(format!(
                "upload with correlation ID '{}' not found",
                params.correlation_id
            )));
        };

        upload.start(&params.options).map_err(|e| {
            error!("failed to start upload {}: {e}", params.correlation_id);
            ErrorResponse::internal(e.to_string())
        })
    }

    fn cancel(&self, payload: &Value) -> Result<(), ErrorResponse> {
        let params: CancelParams = parse_params(payload, "cancel")?;
        info!(correlation_id = %params.correlation_id, "cancel called");

        let Some(upload) = self.uploads.get(&params.correlation_id) else {
            return Err(ErrorResponse::not_found(format!(
                "upload with correlation ID '{}' not found",
                params.correlation_id
            )));
        };

        tokio::spawn(async move {
            upload.cancel(&params.status_code, &params.message);
        });

        Ok(())
    }

    fn activate(self: &Arc<Self>, payload: &Value) -> Result<(), ErrorResponse> {
        let params: ActivateParams = parse_params(payload, "activate")?;

        if let (Some(from), Some(to)) = (params.from, params.to) {
            if to < from {
                return Err(ErrorResponse::bad_request(format!(
                    "period end - {to} - is before period start - {from}"
                )));
            }
        }

        info!(?params, "activate called");
        {
            let mut state = self.state.lock().unwrap();
            state.active = true;
            state.start_time = params.from;
            state.end_time = params.to;
        }

        self.start_executor();
        self.publish_auto_upload_state();

        Ok(())
    }

    fn deactivate(self: &Arc<Self>, payload: &Value) -> Result<(), ErrorResponse> {
        let _ = payload;
        info!("deactivate called");

        {
            let mut state = self.state.lock().unwrap();
            state.active = false;
            state.start_time = None;
            state.end_time = None;
        }

        self.stop_executor();
        self.publish_auto_upload_state();

        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn customizer(&self) -> Option<Arc<dyn UploadCustomizer>> {
        self.customizer.get().and_then(Weak::upgrade)
    }

    fn publish_auto_upload_state(&self) {
        let state = *self.state.lock().unwrap();
        match serde_json::to_value(state) {
            Ok(value) => self.update_property(AUTO_UPLOAD_PROPERTY, value),
            Err(e) => error!("could not serialize auto-upload state: {e}"),
        }
    }

    fn send_upload_request(
        &self,
        correlation_id: &str,
        options: HashMap<String, String>,
        file: &Path,
    ) {
        let request = UploadRequest {
            correlation_id: correlation_id.to_string(),
            options,
        };

        match serde_json::to_value(&request) {
            Ok(value) => {
                self.channel.publish(Envelope::outbox_message(
                    &self.device_id,
                    &self.cfg.name,
                    "request",
                    value,
                ));
                info!(
                    correlation_id,
                    file = %file.display(),
                    "request upload message sent"
                );
            }
            Err(e) => {
                error!(file = %file.display(), "failed to build upload request message: {e}");
            }
        }
    }

    fn start_executor(&self) {
        let mut executor = self.executor.lock().unwrap();
        if let Some(previous) = executor.take() {
            previous.stop();
        }

        let customizer = self.customizer.get().cloned();
        let task: Task = Box::new(move || {
            if let Some(customizer) = customizer.as_ref().and_then(Weak::upgrade) {
                customizer.on_tick();
            }
        });

        let (from, to) = {
            let state = self.state.lock().unwrap();
            (state.start_time, state.end_time)
        };

        match PeriodicExecutor::new(from, to, self.cfg.period.duration(), task) {
            Ok(periodic) => *executor = Some(periodic),
            Err(e) => error!("cannot schedule periodic uploads: {e}"),
        }
    }

    fn stop_executor(&self) {
        let mut executor = self.executor.lock().unwrap();
        if let Some(previous) = executor.take() {
            previous.stop();
        }
    }
}

impl UploadStatusListener for AutoUploadable {
    fn upload_status_updated(&self, status: &UploadStatus) {
        self.status_events.add(status.clone());
    }
}

/// Deserializes an operation payload; a null payload yields the defaults,
/// matching the tolerant decoding of the wire format.
fn parse_params<T: DeserializeOwned + Default>(
    payload: &Value,
    operation: &str,
) -> Result<T, ErrorResponse> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload.clone()).map_err(|_| {
        ErrorResponse::bad_request(format!(
            "invalid '{operation}' operation parameters: {payload}"
        ))
    })
}
