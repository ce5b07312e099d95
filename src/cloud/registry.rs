//! Cloud client registry
//!
//! Creates cloud clients on one shared engine and tears them down, cancelling
//! whatever they still have outstanding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::info;

use crate::cloud::client::{Adapter, CloudClient, CloudRequest};
use crate::cloud::ftp::FtpCloudClient;
use crate::cloud::webdav::WebDavClient;
use crate::cloud::{CloudIo, CloudProtocol};
use crate::error::TransferError;
use crate::storage::FileIoProvider;
use crate::transfer::{Credentials, EngineConfig, UrlRequestManager};
use crate::transport::Transport;
use crate::transport::tls::TlsSettings;

/// Registry of live cloud clients
pub struct CloudIoManager {
    engine: Arc<UrlRequestManager<CloudRequest>>,
    clients: Mutex<HashMap<u64, Arc<CloudClient>>>,
    next_id: AtomicU64,
}

impl Default for CloudIoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudIoManager {
    pub fn new() -> Self {
        Self::from_engine(UrlRequestManager::new())
    }

    pub fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn FileIoProvider>,
    ) -> Self {
        Self::from_engine(UrlRequestManager::with_parts(config, transport, provider))
    }

    fn from_engine(engine: UrlRequestManager<CloudRequest>) -> Self {
        Self {
            engine: Arc::new(engine),
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a client for one server
    ///
    /// # Arguments
    /// * `base_path` - path on the server that operation paths are relative to
    /// * `ca_certs` - PEM CA bundle; only used for secure protocols
    ///
    /// # Returns
    /// * `IllegalArgument` if a password is given without a user
    /// * `InvalidCertificates` if the CA bundle does not parse
    #[allow(clippy::too_many_arguments)]
    pub fn create_client(
        &self,
        io: Arc<dyn CloudIo>,
        protocol: CloudProtocol,
        host: &str,
        port: u16,
        base_path: &str,
        user: Option<&str>,
        password: Option<&str>,
        ca_certs: Option<&[u8]>,
    ) -> Result<Arc<CloudClient>, TransferError> {
        let credentials = match (user, password) {
            (None, Some(_)) => {
                return Err(TransferError::IllegalArgument(
                    "password given without user name".into(),
                ));
            }
            (Some(user), password) => Some(Credentials {
                user: user.to_string(),
                password: password.map(str::to_string),
            }),
            (None, None) => None,
        };
        let secure = protocol.is_secure();
        let tls = match ca_certs {
            Some(pem) if secure && !pem.is_empty() => TlsSettings::from_ca_pem(pem)?,
            _ => TlsSettings::accept_any(),
        };

        let adapter = match protocol {
            CloudProtocol::Ftp | CloudProtocol::Ftps => {
                Adapter::Ftp(FtpCloudClient::new(secure, host, port, base_path, tls, credentials))
            }
            CloudProtocol::Http | CloudProtocol::Https => {
                Adapter::WebDav(WebDavClient::new(secure, host, port, base_path, tls, credentials))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(CloudClient::new(id, protocol, adapter, self.engine.clone(), io));
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, client.clone());
        info!(
            "Created {} cloud client {} for {}:{}{}",
            protocol.scheme(),
            id,
            host,
            port,
            base_path
        );
        Ok(client)
    }

    /// Cancel everything the client has outstanding and release it
    ///
    /// No update for the client is delivered once this returns.
    pub async fn destroy_client(&self, client: &CloudClient) -> Result<(), TransferError> {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client.id());
        let Some(client) = removed else {
            return Err(TransferError::UnknownClient);
        };
        client.mark_destroyed();
        self.engine.cancel_all(client.id()).await;
        info!("Destroyed cloud client {}", client.id());
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn shutdown(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in &clients {
            client.mark_destroyed();
        }
        self.engine.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudIoUpdate;

    struct NullIo;

    impl CloudIo for NullIo {
        fn cloud_operation_update(&self, _update: CloudIoUpdate) {}
    }

    #[tokio::test]
    async fn test_password_without_user_rejected() {
        let manager = CloudIoManager::new();
        let result = manager.create_client(
            Arc::new(NullIo),
            CloudProtocol::Ftp,
            "localhost",
            21,
            "/",
            None,
            Some("secret"),
            None,
        );
        assert!(matches!(result, Err(TransferError::IllegalArgument(_))));
    }

    #[tokio::test]
    async fn test_bad_ca_rejected_only_when_secure() {
        let manager = CloudIoManager::new();
        let insecure = manager.create_client(
            Arc::new(NullIo),
            CloudProtocol::Http,
            "localhost",
            80,
            "/",
            None,
            None,
            Some(b"garbage"),
        );
        assert!(insecure.is_ok());

        let secure = manager.create_client(
            Arc::new(NullIo),
            CloudProtocol::Https,
            "localhost",
            443,
            "/",
            None,
            None,
            Some(b"garbage"),
        );
        assert!(matches!(secure, Err(TransferError::InvalidCertificates(_))));
    }

    #[tokio::test]
    async fn test_destroy_twice_is_unknown() {
        let manager = CloudIoManager::new();
        let client = manager
            .create_client(
                Arc::new(NullIo),
                CloudProtocol::Ftps,
                "localhost",
                990,
                "files",
                Some("user"),
                Some("pass"),
                None,
            )
            .unwrap();
        client.list_init("/").unwrap();
        assert_eq!(manager.client_count(), 1);

        manager.destroy_client(&client).await.unwrap();
        assert_eq!(manager.client_count(), 0);
        assert!(matches!(
            manager.destroy_client(&client).await,
            Err(TransferError::UnknownClient)
        ));
        assert!(matches!(client.list_init("/"), Err(TransferError::UnknownClient)));
    }

    #[tokio::test]
    async fn test_clients_cannot_drive_each_others_operations() {
        let manager = CloudIoManager::new();
        let create = || {
            manager
                .create_client(
                    Arc::new(NullIo),
                    CloudProtocol::Http,
                    "localhost",
                    80,
                    "/",
                    None,
                    None,
                    None,
                )
                .unwrap()
        };
        let alpha = create();
        let bravo = create();
        let id = alpha.list_init("/").unwrap();

        assert!(matches!(
            bravo.start_operation(id),
            Err(TransferError::IllegalArgument(_))
        ));
        bravo.cancel_operation(id).await;
        alpha.start_operation(id).unwrap();

        manager.destroy_client(&bravo).await.unwrap();
        let other = alpha.list_init("/").unwrap();
        assert!(matches!(
            bravo.start_operation(other),
            Err(TransferError::UnknownClient)
        ));
        manager.shutdown().await;
    }
}
