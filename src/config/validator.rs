use anyhow::{anyhow, Result};
use std::collections::HashSet;

use super::types::Config;
use crate::etcd::AclConfig;

/// Validate the configuration; errors here are fatal at startup.
pub fn validate(config: &Config) -> Result<()> {
    if let Some(acl) = &config.etcd.init_acl {
        if !config.etcd.client_transport_security.cert_auth {
            return Err(anyhow!(
                "client-cert-auth must be set to true to enable the initial ACL config"
            ));
        }
        validate_acl(acl)?;
    }

    Ok(())
}

fn validate_acl(acl: &AclConfig) -> Result<()> {
    let mut role_names = HashSet::new();
    let mut user_names = HashSet::new();

    for role in &acl.roles {
        if role.name.is_empty() {
            return Err(anyhow!("empty role name"));
        }

        if role.permissions.is_empty() {
            return Err(anyhow!("empty permissions for role {:?}", role.name));
        }

        for perm in &role.permissions {
            if perm.mode.is_empty() {
                return Err(anyhow!("empty permission 'mode' for role {:?}", role.name));
            }
            if perm.key.is_empty() {
                return Err(anyhow!("empty permission 'key' for role {:?}", role.name));
            }
            match perm.mode.to_lowercase().as_str() {
                "read" | "write" | "readwrite" => {}
                other => {
                    return Err(anyhow!(
                        "invalid permission mode {:?} for role {:?}",
                        other,
                        role.name
                    ))
                }
            }
        }

        if !role_names.insert(role.name.clone()) {
            return Err(anyhow!("duplicated role name {:?}", role.name));
        }
    }

    for user in &acl.users {
        if user.name.is_empty() {
            return Err(anyhow!("empty user name"));
        }

        for role in &user.roles {
            if !role_names.contains(role) && role != "root" {
                return Err(anyhow!("role {:?} not existed", role));
            }
        }

        if !user_names.insert(user.name.clone()) {
            return Err(anyhow!("duplicated user name {:?}", user.name));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd::{AclPermission, AclRole, AclUser, EtcdConfig, SecurityConfig};

    fn acl_config(acl: AclConfig) -> Config {
        Config {
            etcd: EtcdConfig {
                client_transport_security: SecurityConfig {
                    cert_auth: true,
                    ..SecurityConfig::default()
                },
                init_acl: Some(acl),
                ..EtcdConfig::default()
            },
            ..Config::default()
        }
    }

    fn sample_acl() -> AclConfig {
        AclConfig {
            root_password: None,
            roles: vec![AclRole {
                name: "app".to_string(),
                permissions: vec![AclPermission {
                    mode: "readwrite".to_string(),
                    key: "/app".to_string(),
                    prefix: true,
                }],
            }],
            users: vec![AclUser {
                name: "app".to_string(),
                password: None,
                roles: vec!["app".to_string()],
            }],
        }
    }

    #[test]
    fn test_valid_acl() {
        assert!(validate(&acl_config(sample_acl())).is_ok());
    }

    #[test]
    fn test_acl_requires_cert_auth() {
        let mut config = acl_config(sample_acl());
        config.etcd.client_transport_security.cert_auth = false;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_role_name() {
        let mut acl = sample_acl();
        acl.roles[0].name = String::new();
        assert!(validate(&acl_config(acl)).is_err());
    }

    #[test]
    fn test_role_without_permissions() {
        let mut acl = sample_acl();
        acl.roles[0].permissions.clear();
        assert!(validate(&acl_config(acl)).is_err());
    }

    #[test]
    fn test_invalid_permission_mode() {
        let mut acl = sample_acl();
        acl.roles[0].permissions[0].mode = "admin".to_string();
        assert!(validate(&acl_config(acl)).is_err());
    }

    #[test]
    fn test_duplicate_roles() {
        let mut acl = sample_acl();
        acl.roles.push(acl.roles[0].clone());
        assert!(validate(&acl_config(acl)).is_err());
    }

    #[test]
    fn test_user_with_unknown_role() {
        let mut acl = sample_acl();
        acl.users[0].roles.push("missing".to_string());
        assert!(validate(&acl_config(acl)).is_err());
    }

    #[test]
    fn test_root_role_always_allowed() {
        let mut acl = sample_acl();
        acl.users[0].roles.push("root".to_string());
        assert!(validate(&acl_config(acl)).is_ok());
    }

    #[test]
    fn test_no_acl_skips_checks() {
        assert!(validate(&Config::default()).is_ok());
    }
}
