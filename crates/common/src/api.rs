//! Wire DTOs for the collective admin API consumed by `sdpctl`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Paged list envelope used by most collection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResponse<T> {
    /// Returned items.
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Admin interface of an appliance (the HTTPS admin API endpoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminInterface {
    /// Hostname the admin API is reachable at.
    pub hostname: String,
    /// HTTPS port of the admin API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
}

/// Peer interface of an appliance (legacy admin access goes through it).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInterface {
    /// Hostname of the peer interface.
    #[serde(default)]
    pub hostname: String,
    /// HTTPS port of the peer interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
}

/// Enablement flag of a single appliance function.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionToggle {
    /// Whether the function runs on the appliance.
    #[serde(default)]
    pub enabled: bool,
}

/// Roles an appliance can take in the collective.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ApplianceFunction {
    /// Controller: runs the admin API and policy engine.
    Controller,
    /// Gateway: enforces access to protected resources.
    Gateway,
    /// Log server.
    LogServer,
    /// Log forwarder.
    LogForwarder,
    /// Client portal.
    Portal,
    /// Connector.
    Connector,
}

impl ApplianceFunction {
    /// All functions in display order.
    pub const ALL: [ApplianceFunction; 6] = [
        ApplianceFunction::Controller,
        ApplianceFunction::Gateway,
        ApplianceFunction::LogServer,
        ApplianceFunction::LogForwarder,
        ApplianceFunction::Portal,
        ApplianceFunction::Connector,
    ];

    /// Returns the canonical camelCase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplianceFunction::Controller => "controller",
            ApplianceFunction::Gateway => "gateway",
            ApplianceFunction::LogServer => "logServer",
            ApplianceFunction::LogForwarder => "logForwarder",
            ApplianceFunction::Portal => "portal",
            ApplianceFunction::Connector => "connector",
        }
    }

    /// Parses a function name case-insensitively, accepting `log_server` style too.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().to_ascii_lowercase() == normalized)
    }
}

/// Appliance record as returned by `GET /appliances`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appliance {
    /// Appliance identifier.
    pub id: Uuid,
    /// Human readable name, unique within the collective.
    pub name: String,
    /// Hostname of the appliance.
    #[serde(default)]
    pub hostname: String,
    /// Whether the appliance has been activated in the collective.
    #[serde(default)]
    pub activated: bool,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Admin interface; absent on legacy appliances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_interface: Option<AdminInterface>,
    /// Peer interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_interface: Option<PeerInterface>,
    /// Controller function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<FunctionToggle>,
    /// Gateway function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<FunctionToggle>,
    /// Log server function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_server: Option<FunctionToggle>,
    /// Log forwarder function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_forwarder: Option<FunctionToggle>,
    /// Portal function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal: Option<FunctionToggle>,
    /// Connector function toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<FunctionToggle>,
}

impl Appliance {
    /// Returns the functions enabled on this appliance.
    pub fn functions(&self) -> Vec<ApplianceFunction> {
        let toggles = [
            (ApplianceFunction::Controller, self.controller),
            (ApplianceFunction::Gateway, self.gateway),
            (ApplianceFunction::LogServer, self.log_server),
            (ApplianceFunction::LogForwarder, self.log_forwarder),
            (ApplianceFunction::Portal, self.portal),
            (ApplianceFunction::Connector, self.connector),
        ];
        toggles
            .into_iter()
            .filter(|(_, toggle)| toggle.is_some_and(|t| t.enabled))
            .map(|(function, _)| function)
            .collect()
    }

    /// True when the controller function is enabled.
    pub fn is_controller(&self) -> bool {
        self.controller.is_some_and(|t| t.enabled)
    }
}

/// Live statistics for one appliance, from `GET /stats/appliances`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceStat {
    /// Appliance identifier, joins with [`Appliance::id`].
    pub id: Uuid,
    /// Appliance name.
    #[serde(default)]
    pub name: String,
    /// Health status (`healthy`, `busy`, `warning`, `error`, `offline`, `n/a`).
    #[serde(default)]
    pub status: String,
    /// Legacy online flag reported by older appliances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    /// Full version string, e.g. `6.2.1-31234-release`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether the controller is in maintenance mode.
    #[serde(default)]
    pub controller_maintenance: bool,
    /// Free-form status details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApplianceStat {
    /// Online check; an unknown or empty status counts as offline.
    pub fn is_online(&self) -> bool {
        if self.online == Some(true) {
            return true;
        }
        matches!(
            self.status.as_str(),
            "healthy" | "busy" | "warning" | "error"
        )
    }
}

/// Identity provider type as advertised by `GET /identity-providers/names`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    /// Local credentials database.
    Credentials,
    /// OpenID Connect provider.
    Oidc,
    /// LDAP bind.
    Ldap,
    /// LDAP with client certificate.
    LdapCertificate,
    /// RADIUS.
    Radius,
    /// SAML; browser only.
    Saml,
    /// Types this client does not know about.
    #[serde(untagged)]
    Other(String),
}

impl ProviderType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &str {
        match self {
            ProviderType::Credentials => "Credentials",
            ProviderType::Oidc => "Oidc",
            ProviderType::Ldap => "Ldap",
            ProviderType::LdapCertificate => "LdapCertificate",
            ProviderType::Radius => "Radius",
            ProviderType::Saml => "Saml",
            ProviderType::Other(raw) => raw,
        }
    }
}

/// Identity provider summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProvider {
    /// Provider name used in `POST /authentication`.
    pub name: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Provider type.
    #[serde(rename = "type")]
    pub kind: ProviderType,
    /// OIDC authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// OIDC token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// OIDC client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// OIDC scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Body of `POST /authentication`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Name of the identity provider.
    pub provider_name: String,
    /// Stable identifier of this client device.
    pub device_id: Uuid,
    /// Username for credential providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for credential providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// OIDC id token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// OIDC access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Token envelope returned by authentication, authorization and OTP calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Opaque bearer token.
    pub token: String,
    /// Token expiry.
    pub expires: DateTime<Utc>,
}

/// Body of a 406 response to `POST /authentication`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotAcceptable {
    /// Lowest peer API version the server accepts.
    pub min_supported_version: u32,
    /// Highest peer API version the server accepts.
    pub max_supported_version: u32,
}

/// Body of `POST /authentication/otp/initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtpInitializeRequest {
    /// Password of the signed-in user, empty for OIDC.
    pub user_password: String,
}

/// Seed state of the user's OTP secret.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OtpSeedType {
    /// A new secret was generated and must be enrolled.
    Secret,
    /// The user already enrolled an authenticator.
    AlreadySeeded,
}

/// Response of `POST /authentication/otp/initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtpInitializeResponse {
    /// Seed state.
    #[serde(rename = "type")]
    pub kind: OtpSeedType,
    /// Base64 PNG of the enrollment QR code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    /// Shared secret for manual entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Body of `POST /authentication/otp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtpRequest {
    /// One-time password.
    pub otp: String,
}

/// Global settings; unknown fields are preserved so a PUT round-trips them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Whether the backup API is enabled.
    #[serde(default)]
    pub backup_api_enabled: bool,
    /// Passphrase used to encrypt backups; write-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_passphrase: Option<String>,
    /// Remaining settings.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Body of `POST /appliances/{id}/backup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRequest {
    /// Include audit logs.
    pub audit: bool,
    /// Include system logs.
    pub logs: bool,
    /// Called by the appliance when the backup is ready; API version 16 and later.
    #[serde(rename = "notifyUrl", default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
}

/// Response of `POST /appliances/{id}/backup`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupCreated {
    /// Backup identifier.
    pub id: Uuid,
}

/// Response of `GET /appliances/{id}/backup/{backupId}/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupStatus {
    /// `processing` or `done`.
    #[serde(default)]
    pub status: String,
    /// `success` or `failure`; may be absent while processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Response of `GET /appliances/{id}/change/{changeId}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeStatus {
    /// Change identifier.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// `running` or `completed`.
    #[serde(default)]
    pub status: String,
    /// `success` or `failure` once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A field-level validation error inside [`ErrorBody`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    /// Field name.
    #[serde(default)]
    pub field: String,
    /// Message for the field.
    #[serde(default)]
    pub message: String,
}

/// Error document returned by the API for non-2xx responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Error identifier, e.g. `unauthorized`.
    #[serde(default)]
    pub id: String,
    /// Top-level message.
    #[serde(default)]
    pub message: String,
    /// Field errors.
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appliance_functions_follow_toggles() {
        let appliance: Appliance = serde_json::from_value(json!({
            "id": "4c07bc67-57ea-42dd-b702-c2d6c45419fc",
            "name": "controller-one",
            "hostname": "ctrl.example.com",
            "activated": true,
            "adminInterface": {"hostname": "admin.example.com", "httpsPort": 8443},
            "controller": {"enabled": true},
            "gateway": {"enabled": false},
            "logServer": {"enabled": true}
        }))
        .expect("decode");

        assert!(appliance.is_controller());
        assert_eq!(
            appliance.functions(),
            vec![ApplianceFunction::Controller, ApplianceFunction::LogServer]
        );
        assert_eq!(
            appliance.admin_interface.map(|a| a.hostname),
            Some("admin.example.com".to_string())
        );
    }

    #[test]
    fn function_parse_accepts_common_spellings() {
        assert_eq!(
            ApplianceFunction::parse("log_server"),
            Some(ApplianceFunction::LogServer)
        );
        assert_eq!(
            ApplianceFunction::parse("LogForwarder"),
            Some(ApplianceFunction::LogForwarder)
        );
        assert_eq!(ApplianceFunction::parse("router"), None);
    }

    #[test]
    fn stat_online_prefers_legacy_flag_then_status() {
        let mut stat = ApplianceStat {
            status: "offline".into(),
            ..Default::default()
        };
        assert!(!stat.is_online());
        stat.online = Some(true);
        assert!(stat.is_online());
        stat.online = None;
        stat.status = "busy".into();
        assert!(stat.is_online());
        stat.status = String::new();
        assert!(!stat.is_online());
    }

    #[test]
    fn provider_type_keeps_unknown_values() {
        let provider: IdentityProvider = serde_json::from_value(json!({
            "name": "corp",
            "type": "Kerberos"
        }))
        .expect("decode");
        assert_eq!(provider.kind, ProviderType::Other("Kerberos".into()));

        let provider: IdentityProvider = serde_json::from_value(json!({
            "name": "local",
            "type": "Credentials"
        }))
        .expect("decode");
        assert_eq!(provider.kind, ProviderType::Credentials);
    }

    #[test]
    fn global_settings_preserve_unknown_fields() {
        let raw = json!({
            "backupApiEnabled": false,
            "loginBannerMessage": "Authorized use only",
            "spaMode": "TCP"
        });
        let mut settings: GlobalSettings = serde_json::from_value(raw).expect("decode");
        settings.backup_api_enabled = true;
        settings.backup_passphrase = Some("hunter2".into());
        let out = serde_json::to_value(&settings).expect("encode");
        assert_eq!(out["backupApiEnabled"], json!(true));
        assert_eq!(out["backupPassphrase"], json!("hunter2"));
        assert_eq!(out["loginBannerMessage"], json!("Authorized use only"));
        assert_eq!(out["spaMode"], json!("TCP"));
    }
}
