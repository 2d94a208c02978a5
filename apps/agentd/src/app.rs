//! Application orchestrator: wires the broker connection, the uploadable
//! feature and graceful shutdown.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::info;

use uplift_agent::{
    AutoUploadable, EdgeConnector, EdgeEvent, FileUpload, UploadCustomizer,
};

use crate::flags::AgentConfig;

/// Runs the agent until shutdown is requested.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let (events_tx, mut events) = mpsc::channel(16);
    let connector = EdgeConnector::connect(&config.broker, events_tx).await?;

    info!("waiting for edge configuration...");

    // The feature is (re)created whenever the twin layer announces a new
    // edge identity.
    let mut active: Option<(Arc<FileUpload>, Arc<AutoUploadable>)> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }

            event = events.recv() => {
                match event {
                    None => break,
                    Some(EdgeEvent::Configuration(edge)) => {
                        if let Some((_, uploadable)) = active.take() {
                            uploadable.disconnect().await;
                        }

                        let channel = connector.twin_channel(&edge);
                        let uploadable =
                            AutoUploadable::new(&edge.device_id, config.uploadable.clone(), channel);
                        let file_upload = FileUpload::new(
                            config.files.clone(),
                            config.mode,
                            Arc::clone(&uploadable),
                        );
                        let customizer: Weak<dyn UploadCustomizer> =
                            Arc::downgrade(&file_upload) as Weak<dyn UploadCustomizer>;
                        uploadable.set_customizer(customizer);
                        uploadable.connect();

                        info!(device = %edge.device_id, "uploadable feature connected");
                        active = Some((file_upload, uploadable));
                    }
                    Some(EdgeEvent::Command(envelope)) => {
                        if let Some((_, uploadable)) = &active {
                            let uploadable = Arc::clone(uploadable);
                            let connector = connector.clone();
                            tokio::spawn(async move {
                                if let Some(reply) = uploadable.handle_envelope(&envelope) {
                                    connector.send_reply(reply);
                                }
                            });
                        }
                    }
                }
            }
        }
    }

    if let Some((_, uploadable)) = active.take() {
        uploadable.disconnect().await;
    }
    connector.close().await;

    Ok(())
}
