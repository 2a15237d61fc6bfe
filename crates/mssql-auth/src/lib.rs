//! # mssql-auth
//!
//! Authentication strategies for SQL Server connections.
//!
//! This crate provides various authentication methods, isolated from
//! connection logic for better modularity and testing.
//!
//! ## Supported Authentication Methods
//!
//! | Method | Feature Flag | Description |
//! |--------|--------------|-------------|
//! | SQL Authentication | default | Username/password |
//! | Azure AD Token | default | Pre-obtained access token |
//! | Azure Managed Identity | `azure-identity` | VM/container identity |
//! | Service Principal | `azure-identity` | App credentials |
//! | Integrated (Kerberos) | `integrated-auth` | GSSAPI/Kerberos |
//! | Certificate | `cert-auth` | Client certificate |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod credentials;
pub mod error;
pub mod provider;
pub mod sql_auth;

#[cfg(feature = "azure-identity")]
pub mod azure_ad;
#[cfg(feature = "azure-identity")]
pub mod azure_identity_auth;
#[cfg(feature = "cert-auth")]
pub mod cert_auth;
#[cfg(feature = "integrated-auth")]
pub mod integrated_auth;

#[cfg(feature = "always-encrypted")]
pub mod aead;
#[cfg(feature = "always-encrypted")]
pub mod encryption;
#[cfg(feature = "always-encrypted")]
pub mod key_store;
#[cfg(feature = "always-encrypted")]
pub mod key_unwrap;

pub use credentials::Credentials;
#[cfg(feature = "zeroize")]
pub use credentials::{SecretString, SecureCredentials};
pub use error::AuthError;
pub use provider::{AsyncAuthProvider, AuthData, AuthMethod, AuthProvider};
pub use sql_auth::SqlAuthenticator;

#[cfg(feature = "azure-identity")]
pub use azure_ad::{AzureAdAuth, FedAuthLibrary, FedAuthWorkflow};
#[cfg(feature = "azure-identity")]
pub use azure_identity_auth::{ManagedIdentityAuth, ServicePrincipalAuth};
#[cfg(feature = "cert-auth")]
pub use cert_auth::CertificateAuth;
#[cfg(feature = "integrated-auth")]
pub use integrated_auth::IntegratedAuth;

#[cfg(feature = "always-encrypted")]
pub use aead::{AeadEncryptor, DerivedKeys};
#[cfg(feature = "always-encrypted")]
pub use encryption::{
    ColumnEncryptionConfig, ColumnEncryptionInfo, CekMetadata, EncryptedValue, EncryptionError,
    EncryptionType, KeyStoreProvider,
};
#[cfg(feature = "always-encrypted")]
pub use key_store::{CekCache, CekCacheKey, InMemoryKeyStore};
#[cfg(feature = "always-encrypted")]
pub use key_unwrap::RsaKeyUnwrapper;
