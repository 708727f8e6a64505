//! Samba AD command surface and input validation.
//!
//! Every input is validated against well-known enums and conservative
//! character rules before it can become an argv entry; nothing here ever
//! passes through a shell.

use quay_supervisor::{CommandRequest, SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};

// ── Enumerated options ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Dc,
    Member,
    Standalone,
}

impl ServerRole {
    pub fn as_flag(&self) -> &'static str {
        match self {
            ServerRole::Dc => "dc",
            ServerRole::Member => "member",
            ServerRole::Standalone => "standalone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionLevel {
    #[serde(rename = "2008_R2")]
    Level2008R2,
    #[serde(rename = "2012")]
    Level2012,
    #[serde(rename = "2012_R2")]
    Level2012R2,
    #[serde(rename = "2016")]
    Level2016,
}

impl FunctionLevel {
    pub fn as_flag(&self) -> &'static str {
        match self {
            FunctionLevel::Level2008R2 => "2008_R2",
            FunctionLevel::Level2012 => "2012",
            FunctionLevel::Level2012R2 => "2012_R2",
            FunctionLevel::Level2016 => "2016",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsBackend {
    #[serde(rename = "SAMBA_INTERNAL")]
    SambaInternal,
    #[serde(rename = "BIND9_DLZ")]
    Bind9Dlz,
    #[serde(rename = "NONE")]
    None,
}

impl DnsBackend {
    pub fn as_flag(&self) -> &'static str {
        match self {
            DnsBackend::SambaInternal => "SAMBA_INTERNAL",
            DnsBackend::Bind9Dlz => "BIND9_DLZ",
            DnsBackend::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmoRole {
    Schema,
    Naming,
    Pdc,
    Rid,
    Infrastructure,
}

impl FsmoRole {
    pub fn as_flag(&self) -> &'static str {
        match self {
            FsmoRole::Schema => "schema",
            FsmoRole::Naming => "naming",
            FsmoRole::Pdc => "pdc",
            FsmoRole::Rid => "rid",
            FsmoRole::Infrastructure => "infrastructure",
        }
    }
}

// ── Provisioning ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionOptions {
    /// Kerberos realm (`EXAMPLE.COM`).
    pub realm: String,
    /// NetBIOS domain name (`EXAMPLE`).
    pub domain: String,
    pub admin_password: String,
    pub server_role: ServerRole,
    pub function_level: FunctionLevel,
    pub dns_backend: DnsBackend,
    #[serde(default)]
    pub host_ip: Option<String>,
}

impl ProvisionOptions {
    pub fn validate(&self) -> SupervisorResult<()> {
        validate_realm(&self.realm)?;
        validate_netbios(&self.domain)?;
        validate_password(&self.admin_password)?;
        if let Some(ip) = &self.host_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(SupervisorError::validation(format!(
                    "host_ip '{}' is not an IP address",
                    ip
                )));
            }
        }
        Ok(())
    }
}

// ── Running-domain commands ──────────────────────────────────────────

/// Typed command set for a provisioned, running domain.
#[derive(Debug, Clone, PartialEq)]
pub enum SambaCommand {
    DomainInfo,
    DomainLevelRaise { level: FunctionLevel },
    UserCreate { username: String, password: String },
    UserDelete { username: String },
    UserList,
    UserEnable { username: String },
    UserDisable { username: String },
    UserSetPassword { username: String, password: String },
    GroupCreate { name: String },
    GroupDelete { name: String },
    GroupList,
    GroupAddMembers { name: String, members: Vec<String> },
    GroupRemoveMembers { name: String, members: Vec<String> },
    ComputerList,
    ComputerDelete { name: String },
    OuCreate { ou_dn: String },
    OuDelete { ou_dn: String },
    OuList,
    GpoList,
    GpoBackup { gpo: String, path: String },
    DnsZoneCreate { zone: String },
    DnsZoneDelete { zone: String },
    DnsZoneList,
    DnsRecordAdd { zone: String, name: String, rtype: String, data: String },
    DnsRecordDelete { zone: String, name: String, rtype: String, data: String },
    DnsRecordList { zone: String },
    FsmoShow,
    FsmoTransfer { role: FsmoRole },
    FsmoSeize { role: FsmoRole },
    NtaclGet { path: String },
    NtaclSet { acl: String, path: String },
    KeytabExport { path: String },
    TestParm,
    DbCheck,
    Backup { target_dir: String },
}

impl SambaCommand {
    pub fn parse(request: &CommandRequest) -> SupervisorResult<Self> {
        let p = &request.params;
        let command = match request.action.as_str() {
            "domain_info" => SambaCommand::DomainInfo,
            "domain_level_raise" => SambaCommand::DomainLevelRaise {
                level: field(p, "level")?,
            },
            "user_create" => SambaCommand::UserCreate {
                username: name_field(p, "username")?,
                password: password_field(p)?,
            },
            "user_delete" => SambaCommand::UserDelete {
                username: name_field(p, "username")?,
            },
            "user_list" => SambaCommand::UserList,
            "user_enable" => SambaCommand::UserEnable {
                username: name_field(p, "username")?,
            },
            "user_disable" => SambaCommand::UserDisable {
                username: name_field(p, "username")?,
            },
            "user_set_password" => SambaCommand::UserSetPassword {
                username: name_field(p, "username")?,
                password: password_field(p)?,
            },
            "group_create" => SambaCommand::GroupCreate {
                name: name_field(p, "name")?,
            },
            "group_delete" => SambaCommand::GroupDelete {
                name: name_field(p, "name")?,
            },
            "group_list" => SambaCommand::GroupList,
            "group_add_members" => SambaCommand::GroupAddMembers {
                name: name_field(p, "name")?,
                members: members_field(p)?,
            },
            "group_remove_members" => SambaCommand::GroupRemoveMembers {
                name: name_field(p, "name")?,
                members: members_field(p)?,
            },
            "computer_list" => SambaCommand::ComputerList,
            "computer_delete" => SambaCommand::ComputerDelete {
                name: name_field(p, "name")?,
            },
            "ou_create" => SambaCommand::OuCreate {
                ou_dn: dn_field(p, "ou_dn")?,
            },
            "ou_delete" => SambaCommand::OuDelete {
                ou_dn: dn_field(p, "ou_dn")?,
            },
            "ou_list" => SambaCommand::OuList,
            "gpo_list" => SambaCommand::GpoList,
            "gpo_backup" => SambaCommand::GpoBackup {
                gpo: name_field(p, "gpo")?,
                path: path_field(p, "path")?,
            },
            "dns_zone_create" => SambaCommand::DnsZoneCreate {
                zone: zone_field(p)?,
            },
            "dns_zone_delete" => SambaCommand::DnsZoneDelete {
                zone: zone_field(p)?,
            },
            "dns_zone_list" => SambaCommand::DnsZoneList,
            "dns_record_add" => SambaCommand::DnsRecordAdd {
                zone: zone_field(p)?,
                name: name_field(p, "name")?,
                rtype: rtype_field(p)?,
                data: text_field(p, "data")?,
            },
            "dns_record_delete" => SambaCommand::DnsRecordDelete {
                zone: zone_field(p)?,
                name: name_field(p, "name")?,
                rtype: rtype_field(p)?,
                data: text_field(p, "data")?,
            },
            "dns_record_list" => SambaCommand::DnsRecordList {
                zone: zone_field(p)?,
            },
            "fsmo_show" => SambaCommand::FsmoShow,
            "fsmo_transfer" => SambaCommand::FsmoTransfer {
                role: field(p, "role")?,
            },
            "fsmo_seize" => SambaCommand::FsmoSeize {
                role: field(p, "role")?,
            },
            "ntacl_get" => SambaCommand::NtaclGet {
                path: path_field(p, "path")?,
            },
            "ntacl_set" => SambaCommand::NtaclSet {
                acl: text_field(p, "acl")?,
                path: path_field(p, "path")?,
            },
            "keytab_export" => SambaCommand::KeytabExport {
                path: path_field(p, "path")?,
            },
            "testparm" => SambaCommand::TestParm,
            "dbcheck" => SambaCommand::DbCheck,
            "backup" => SambaCommand::Backup {
                target_dir: path_field(p, "target_dir")?,
            },
            other => return Err(SupervisorError::unsupported(other)),
        };
        Ok(command)
    }

    /// The argv tail handed to `samba-tool` (program name excluded).
    pub fn build_args(&self) -> Vec<String> {
        fn s(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|p| p.to_string()).collect()
        }
        match self {
            SambaCommand::DomainInfo => s(&["domain", "info", "127.0.0.1"]),
            SambaCommand::DomainLevelRaise { level } => {
                let mut args = s(&["domain", "level", "raise"]);
                args.push(format!("--domain-level={}", level.as_flag()));
                args.push(format!("--forest-level={}", level.as_flag()));
                args
            }
            SambaCommand::UserCreate { username, password } => {
                let mut args = s(&["user", "create"]);
                args.push(username.clone());
                args.push(password.clone());
                args
            }
            SambaCommand::UserDelete { username } => {
                let mut args = s(&["user", "delete"]);
                args.push(username.clone());
                args
            }
            SambaCommand::UserList => s(&["user", "list"]),
            SambaCommand::UserEnable { username } => {
                let mut args = s(&["user", "enable"]);
                args.push(username.clone());
                args
            }
            SambaCommand::UserDisable { username } => {
                let mut args = s(&["user", "disable"]);
                args.push(username.clone());
                args
            }
            SambaCommand::UserSetPassword { username, password } => {
                let mut args = s(&["user", "setpassword"]);
                args.push(username.clone());
                args.push(format!("--newpassword={}", password));
                args
            }
            SambaCommand::GroupCreate { name } => {
                let mut args = s(&["group", "add"]);
                args.push(name.clone());
                args
            }
            SambaCommand::GroupDelete { name } => {
                let mut args = s(&["group", "delete"]);
                args.push(name.clone());
                args
            }
            SambaCommand::GroupList => s(&["group", "list"]),
            SambaCommand::GroupAddMembers { name, members } => {
                let mut args = s(&["group", "addmembers"]);
                args.push(name.clone());
                args.push(members.join(","));
                args
            }
            SambaCommand::GroupRemoveMembers { name, members } => {
                let mut args = s(&["group", "removemembers"]);
                args.push(name.clone());
                args.push(members.join(","));
                args
            }
            SambaCommand::ComputerList => s(&["computer", "list"]),
            SambaCommand::ComputerDelete { name } => {
                let mut args = s(&["computer", "delete"]);
                args.push(name.clone());
                args
            }
            SambaCommand::OuCreate { ou_dn } => {
                let mut args = s(&["ou", "create"]);
                args.push(ou_dn.clone());
                args
            }
            SambaCommand::OuDelete { ou_dn } => {
                let mut args = s(&["ou", "delete"]);
                args.push(ou_dn.clone());
                args
            }
            SambaCommand::OuList => s(&["ou", "list"]),
            SambaCommand::GpoList => s(&["gpo", "listall"]),
            SambaCommand::GpoBackup { gpo, path } => {
                let mut args = s(&["gpo", "backup"]);
                args.push(gpo.clone());
                args.push(format!("--tmpdir={}", path));
                args
            }
            SambaCommand::DnsZoneCreate { zone } => {
                let mut args = s(&["dns", "zonecreate", "127.0.0.1"]);
                args.push(zone.clone());
                args
            }
            SambaCommand::DnsZoneDelete { zone } => {
                let mut args = s(&["dns", "zonedelete", "127.0.0.1"]);
                args.push(zone.clone());
                args
            }
            SambaCommand::DnsZoneList => s(&["dns", "zonelist", "127.0.0.1"]),
            SambaCommand::DnsRecordAdd {
                zone,
                name,
                rtype,
                data,
            } => {
                let mut args = s(&["dns", "add", "127.0.0.1"]);
                args.push(zone.clone());
                args.push(name.clone());
                args.push(rtype.clone());
                args.push(data.clone());
                args
            }
            SambaCommand::DnsRecordDelete {
                zone,
                name,
                rtype,
                data,
            } => {
                let mut args = s(&["dns", "delete", "127.0.0.1"]);
                args.push(zone.clone());
                args.push(name.clone());
                args.push(rtype.clone());
                args.push(data.clone());
                args
            }
            SambaCommand::DnsRecordList { zone } => {
                let mut args = s(&["dns", "query", "127.0.0.1"]);
                args.push(zone.clone());
                args.push("@".into());
                args.push("ALL".into());
                args
            }
            SambaCommand::FsmoShow => s(&["fsmo", "show"]),
            SambaCommand::FsmoTransfer { role } => {
                let mut args = s(&["fsmo", "transfer"]);
                args.push(format!("--role={}", role.as_flag()));
                args
            }
            SambaCommand::FsmoSeize { role } => {
                let mut args = s(&["fsmo", "seize"]);
                args.push(format!("--role={}", role.as_flag()));
                args
            }
            SambaCommand::NtaclGet { path } => {
                let mut args = s(&["ntacl", "get"]);
                args.push(path.clone());
                args
            }
            SambaCommand::NtaclSet { acl, path } => {
                let mut args = s(&["ntacl", "set"]);
                args.push(acl.clone());
                args.push(path.clone());
                args
            }
            SambaCommand::KeytabExport { path } => {
                let mut args = s(&["domain", "exportkeytab"]);
                args.push(path.clone());
                args
            }
            SambaCommand::TestParm => s(&["testparm"]),
            SambaCommand::DbCheck => s(&["dbcheck"]),
            SambaCommand::Backup { target_dir } => {
                let mut args = s(&["domain", "backup", "online"]);
                args.push(format!("--targetdir={}", target_dir));
                args.push("--server=127.0.0.1".into());
                args
            }
        }
    }
}

/// Provision argv (the one command that runs against a stopped daemon).
pub fn provision_args(options: &ProvisionOptions) -> Vec<String> {
    let mut args: Vec<String> = vec!["domain".into(), "provision".into()];
    args.push(format!("--realm={}", options.realm));
    args.push(format!("--domain={}", options.domain));
    args.push(format!("--adminpass={}", options.admin_password));
    args.push(format!("--server-role={}", options.server_role.as_flag()));
    args.push(format!(
        "--function-level={}",
        options.function_level.as_flag()
    ));
    args.push(format!("--dns-backend={}", options.dns_backend.as_flag()));
    if let Some(ip) = &options.host_ip {
        args.push(format!("--host-ip={}", ip));
    }
    args.push("--use-rfc2307".into());
    args
}

// ── Field helpers & validation ───────────────────────────────────────

fn field<T: serde::de::DeserializeOwned>(
    params: &serde_json::Value,
    key: &str,
) -> SupervisorResult<T> {
    let value = params
        .get(key)
        .ok_or_else(|| SupervisorError::validation(format!("Missing field '{}'", key)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| SupervisorError::validation(format!("Field '{}': {}", key, e)))
}

fn text_field(params: &serde_json::Value, key: &str) -> SupervisorResult<String> {
    let value: String = field(params, key)?;
    if value.is_empty() || value.len() > 1024 || value.contains(['\n', '\r', '\0']) {
        return Err(SupervisorError::validation(format!(
            "Field '{}' is empty, too long, or contains control characters",
            key
        )));
    }
    Ok(value)
}

/// sAMAccountName-ish identifiers: letters, digits, and a safe subset.
fn name_field(params: &serde_json::Value, key: &str) -> SupervisorResult<String> {
    let value = text_field(params, key)?;
    validate_name(&value)?;
    Ok(value)
}

fn members_field(params: &serde_json::Value) -> SupervisorResult<Vec<String>> {
    let members: Vec<String> = field(params, "members")?;
    if members.is_empty() {
        return Err(SupervisorError::validation("members must not be empty"));
    }
    for member in &members {
        validate_name(member)?;
    }
    Ok(members)
}

fn password_field(params: &serde_json::Value) -> SupervisorResult<String> {
    let value: String = field(params, "password")?;
    validate_password(&value)?;
    Ok(value)
}

fn dn_field(params: &serde_json::Value, key: &str) -> SupervisorResult<String> {
    let value = text_field(params, key)?;
    if !value.to_ascii_uppercase().starts_with("OU=") {
        return Err(SupervisorError::validation(format!(
            "Field '{}' must be an OU distinguished name",
            key
        )));
    }
    Ok(value)
}

fn path_field(params: &serde_json::Value, key: &str) -> SupervisorResult<String> {
    let value = text_field(params, key)?;
    if !value.starts_with('/') || value.contains("..") {
        return Err(SupervisorError::validation(format!(
            "Field '{}' must be an absolute path without '..'",
            key
        )));
    }
    Ok(value)
}

fn zone_field(params: &serde_json::Value) -> SupervisorResult<String> {
    let value = text_field(params, "zone")?;
    let ok = value
        .split('.')
        .all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if !ok {
        return Err(SupervisorError::validation(format!(
            "'{}' is not a valid DNS zone",
            value
        )));
    }
    Ok(value)
}

fn rtype_field(params: &serde_json::Value) -> SupervisorResult<String> {
    let value = text_field(params, "rtype")?.to_ascii_uppercase();
    const KNOWN: [&str; 8] = ["A", "AAAA", "CNAME", "MX", "NS", "PTR", "SRV", "TXT"];
    if !KNOWN.contains(&value.as_str()) {
        return Err(SupervisorError::validation(format!(
            "Record type '{}' is not one of {:?}",
            value, KNOWN
        )));
    }
    Ok(value)
}

pub fn validate_name(value: &str) -> SupervisorResult<()> {
    let ok = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '$'));
    if ok {
        Ok(())
    } else {
        Err(SupervisorError::validation(format!(
            "'{}' is not a valid account name",
            value
        )))
    }
}

pub fn validate_realm(realm: &str) -> SupervisorResult<()> {
    let ok = realm.contains('.')
        && realm
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if ok {
        Ok(())
    } else {
        Err(SupervisorError::validation(format!(
            "'{}' is not a valid realm",
            realm
        )))
    }
}

pub fn validate_netbios(domain: &str) -> SupervisorResult<()> {
    let ok = !domain.is_empty()
        && domain.len() <= 15
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(SupervisorError::validation(format!(
            "'{}' is not a valid NetBIOS domain name",
            domain
        )))
    }
}

pub fn validate_password(password: &str) -> SupervisorResult<()> {
    if password.len() < 8 || password.contains(['\n', '\r', '\0']) {
        return Err(SupervisorError::validation(
            "Password must be at least 8 characters without control characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_supervisor::SupervisorErrorKind;
    use serde_json::json;

    fn provision_options() -> ProvisionOptions {
        ProvisionOptions {
            realm: "AD.EXAMPLE.COM".into(),
            domain: "EXAMPLE".into(),
            admin_password: "Sup3rSecret!".into(),
            server_role: ServerRole::Dc,
            function_level: FunctionLevel::Level2016,
            dns_backend: DnsBackend::SambaInternal,
            host_ip: Some("192.0.2.5".into()),
        }
    }

    #[test]
    fn provision_args_shape() {
        let opts = provision_options();
        opts.validate().unwrap();
        let args = provision_args(&opts);
        assert_eq!(args[0], "domain");
        assert_eq!(args[1], "provision");
        assert!(args.contains(&"--realm=AD.EXAMPLE.COM".to_string()));
        assert!(args.contains(&"--server-role=dc".to_string()));
        assert!(args.contains(&"--function-level=2016".to_string()));
        assert!(args.contains(&"--dns-backend=SAMBA_INTERNAL".to_string()));
        assert!(args.contains(&"--host-ip=192.0.2.5".to_string()));
    }

    #[test]
    fn provision_validation_rejects_bad_inputs() {
        let mut opts = provision_options();
        opts.realm = "no-dots".into();
        assert!(opts.validate().is_err());

        let mut opts = provision_options();
        opts.domain = "WAY-TOO-LONG-NETBIOS".into();
        assert!(opts.validate().is_err());

        let mut opts = provision_options();
        opts.admin_password = "short".into();
        assert!(opts.validate().is_err());

        let mut opts = provision_options();
        opts.host_ip = Some("not-an-ip".into());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn function_level_serde_names() {
        let level: FunctionLevel = serde_json::from_value(json!("2008_R2")).unwrap();
        assert_eq!(level, FunctionLevel::Level2008R2);
        let level: FunctionLevel = serde_json::from_value(json!("2016")).unwrap();
        assert_eq!(level, FunctionLevel::Level2016);
        assert!(serde_json::from_value::<FunctionLevel>(json!("2003")).is_err());
    }

    #[test]
    fn user_create_parse_and_args() {
        let req = CommandRequest::new(
            "user_create",
            json!({"username": "jdoe", "password": "Passw0rd!x"}),
        );
        let cmd = SambaCommand::parse(&req).unwrap();
        let args = cmd.build_args();
        assert_eq!(args, vec!["user", "create", "jdoe", "Passw0rd!x"]);
    }

    #[test]
    fn shell_metacharacters_never_reach_argv() {
        let req = CommandRequest::new(
            "user_create",
            json!({"username": "jdoe; rm -rf /", "password": "Passw0rd!x"}),
        );
        let err = SambaCommand::parse(&req).unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Validation);

        let req = CommandRequest::new("dns_zone_create", json!({"zone": "ex;ample.com"}));
        assert!(SambaCommand::parse(&req).is_err());
    }

    #[test]
    fn group_members_join() {
        let req = CommandRequest::new(
            "group_add_members",
            json!({"name": "staff", "members": ["alice", "bob"]}),
        );
        let cmd = SambaCommand::parse(&req).unwrap();
        assert_eq!(
            cmd.build_args(),
            vec!["group", "addmembers", "staff", "alice,bob"]
        );
    }

    #[test]
    fn empty_members_rejected() {
        let req = CommandRequest::new(
            "group_add_members",
            json!({"name": "staff", "members": []}),
        );
        assert!(SambaCommand::parse(&req).is_err());
    }

    #[test]
    fn dns_record_roundtrip() {
        let req = CommandRequest::new(
            "dns_record_add",
            json!({"zone": "example.com", "name": "nas", "rtype": "a", "data": "192.0.2.9"}),
        );
        let cmd = SambaCommand::parse(&req).unwrap();
        let args = cmd.build_args();
        assert_eq!(
            args,
            vec!["dns", "add", "127.0.0.1", "example.com", "nas", "A", "192.0.2.9"]
        );
    }

    #[test]
    fn unknown_record_type_rejected() {
        let req = CommandRequest::new(
            "dns_record_add",
            json!({"zone": "example.com", "name": "nas", "rtype": "SPF", "data": "x"}),
        );
        assert!(SambaCommand::parse(&req).is_err());
    }

    #[test]
    fn fsmo_roles() {
        let req = CommandRequest::new("fsmo_transfer", json!({"role": "pdc"}));
        let cmd = SambaCommand::parse(&req).unwrap();
        assert_eq!(cmd.build_args(), vec!["fsmo", "transfer", "--role=pdc"]);
        let req = CommandRequest::new("fsmo_seize", json!({"role": "schema"}));
        let cmd = SambaCommand::parse(&req).unwrap();
        assert_eq!(cmd.build_args(), vec!["fsmo", "seize", "--role=schema"]);
    }

    #[test]
    fn paths_must_be_absolute() {
        let req = CommandRequest::new("keytab_export", json!({"path": "relative/keytab"}));
        assert!(SambaCommand::parse(&req).is_err());
        let req = CommandRequest::new("keytab_export", json!({"path": "/etc/../secret"}));
        assert!(SambaCommand::parse(&req).is_err());
        let req = CommandRequest::new("keytab_export", json!({"path": "/var/lib/quaynas/ad.keytab"}));
        assert!(SambaCommand::parse(&req).is_ok());
    }

    #[test]
    fn ou_requires_dn() {
        let req = CommandRequest::new("ou_create", json!({"ou_dn": "Engineering"}));
        assert!(SambaCommand::parse(&req).is_err());
        let req = CommandRequest::new("ou_create", json!({"ou_dn": "OU=Engineering,DC=ad,DC=example,DC=com"}));
        assert!(SambaCommand::parse(&req).is_ok());
    }

    #[test]
    fn maintenance_commands() {
        assert_eq!(
            SambaCommand::parse(&CommandRequest::bare("testparm")).unwrap().build_args(),
            vec!["testparm"]
        );
        assert_eq!(
            SambaCommand::parse(&CommandRequest::bare("dbcheck")).unwrap().build_args(),
            vec!["dbcheck"]
        );
        let req = CommandRequest::new("backup", json!({"target_dir": "/var/backups/ad"}));
        let args = SambaCommand::parse(&req).unwrap().build_args();
        assert!(args.contains(&"--targetdir=/var/backups/ad".to_string()));
    }

    #[test]
    fn unsupported_action() {
        let err = SambaCommand::parse(&CommandRequest::bare("domain_demote")).unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Unsupported);
    }
}
