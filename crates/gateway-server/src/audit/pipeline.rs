//! Audit pipeline bootstrap
//!
//! Wires the audit log client, record factory, post-log queue and worker
//! from configuration. With audit logging disabled the transport is built on
//! no-op services so traffic is still proxied.

use std::sync::Arc;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::{AuditlogAuth, AuditlogError, HttpAuditlogClient, OAuthTokenSource};
use super::factory::MessageFactory;
use super::service::{AuditlogService, NoOpAuditlogService};
use super::transport::AuditLayer;
use super::worker::{self, AuditWorker, NoOpSink};
use crate::config::{AuditlogConfig, AuthConfig, DEFAULT_MSG_BODY_SIZE_LIMIT};
use crate::metrics::AuditlogMetrics;

pub struct AuditPipeline {
    pub layer: AuditLayer,
    /// Post-log worker, absent when audit logging is disabled
    pub worker: Option<JoinHandle<()>>,
}

impl AuditPipeline {
    /// Build the pipeline. Must be called inside a tokio runtime since the
    /// worker is spawned immediately.
    pub fn from_config(
        config: Option<&AuditlogConfig>,
        shutdown: CancellationToken,
        metrics: AuditlogMetrics,
    ) -> Result<Self, AuditlogError> {
        match config {
            Some(config) => Self::enabled(config, shutdown, metrics),
            None => {
                info!("Audit log is disabled");
                Ok(Self::disabled())
            },
        }
    }

    pub fn disabled() -> Self {
        Self {
            layer: AuditLayer::new(
                Arc::new(NoOpAuditlogService),
                Arc::new(NoOpSink),
                DEFAULT_MSG_BODY_SIZE_LIMIT,
            ),
            worker: None,
        }
    }

    fn enabled(
        config: &AuditlogConfig,
        shutdown: CancellationToken,
        metrics: AuditlogMetrics,
    ) -> Result<Self, AuditlogError> {
        let http = Client::builder().timeout(config.client_timeout()).build()?;

        let auth = match &config.auth {
            AuthConfig::Basic { user, password, .. } => AuditlogAuth::Basic {
                user: user.clone(),
                password: password.clone(),
            },
            AuthConfig::OAuth {
                client_id,
                client_secret,
                oauth_url,
                token_path,
                ..
            } => AuditlogAuth::OAuth(OAuthTokenSource::new(
                http.clone(),
                oauth_url,
                token_path,
                client_id.as_str(),
                client_secret.as_str(),
            )?),
        };

        let client = HttpAuditlogClient::new(
            http,
            &config.url,
            &config.config_path,
            &config.security_path,
            auth,
        )?
        .with_metrics(metrics.clone());
        let service = Arc::new(AuditlogService::new(
            Arc::new(client),
            MessageFactory::system(config.auth.tenant()),
            config.auth.audit_user(),
        ));

        let (sink, receiver) = worker::channel(config.channel_size, config.channel_timeout());
        let worker = AuditWorker::new(receiver, service.clone(), shutdown)
            .with_metrics(metrics.clone())
            .spawn();

        info!(
            url = %config.url,
            shard_limit = config.msg_body_size_limit,
            channel_size = config.channel_size,
            "Audit log is enabled"
        );

        Ok(Self {
            layer: AuditLayer::new(service, Arc::new(sink), config.msg_body_size_limit)
                .with_metrics(metrics),
            worker: Some(worker),
        })
    }
}
