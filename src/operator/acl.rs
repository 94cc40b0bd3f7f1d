//! Initial ACL reconciliation
//!
//! Once the cluster reports OK, the seeder idempotently enables auth and
//! converges the configured roles and users: a `root` role bound to the
//! operator's client-certificate identity, plus whatever the configuration
//! declares. The applied configuration is persisted in the store itself so
//! subsequent reconciliations can diff against it.

use anyhow::{anyhow, Context, Result};
use etcd_client::{Permission, UserAddOptions};
use std::path::Path;

use crate::etcd::{AclConfig, Client};

pub const INIT_ACL_CONFIG_KEY: &str = "/eco-operator/init-acl-config";

/// Reconcile the initial ACL configuration. Idempotent; safe to run on every
/// tick the seeder spends in OK.
pub async fn reconcile_init_acl(
    client: &Client,
    config: &AclConfig,
    cert_file: &Path,
) -> Result<()> {
    let common_name = cert_common_name(cert_file)?;

    enable_acl(client, config, &common_name).await?;

    let old = read_applied_config(client).await?;
    if old.as_ref() != Some(config) {
        if let Some(old) = old {
            remove_acl_config(client, &old).await?;
        }
        apply_acl_config(client, config).await?;
        tracing::info!("initial ACL configuration applied");
    }

    Ok(())
}

/// Enable auth with a root role bound to the operator's certificate identity.
async fn enable_acl(client: &Client, config: &AclConfig, common_name: &str) -> Result<()> {
    let mut auth = client.raw().auth_client();

    // Already bootstrapped? The certificate identity holding root is the
    // marker.
    if let Ok(resp) = auth.user_get(common_name).await {
        if resp.roles().iter().any(|role| role == "root") {
            return Ok(());
        }
        auth.user_delete(common_name)
            .await
            .context("failed to reset certificate identity user")?;
    }

    match auth.role_add("root").await {
        Ok(_) => {}
        Err(e) if is_already_exists(&e) => {}
        Err(e) => return Err(anyhow!(e).context("failed to add root role")),
    }

    let root_password = config.root_password.as_deref().unwrap_or_default();
    let root_add = if root_password.is_empty() {
        auth.user_add("root", "", Some(UserAddOptions::new().with_no_pwd()))
            .await
    } else {
        auth.user_add("root", root_password, None).await
    };
    match root_add {
        Ok(_) => {}
        Err(e) if is_already_exists(&e) => {}
        Err(e) => return Err(anyhow!(e).context("failed to add root user")),
    }
    auth.user_grant_role("root", "root")
        .await
        .context("failed to grant root")?;

    for user in [common_name, "etcd"] {
        match auth
            .user_add(user, "", Some(UserAddOptions::new().with_no_pwd()))
            .await
        {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {}
            Err(e) => return Err(anyhow!(e).context(format!("failed to add user {:?}", user))),
        }
        auth.user_grant_role(user, "root")
            .await
            .with_context(|| format!("failed to grant root to {:?}", user))?;
    }

    auth.auth_enable().await.context("failed to enable auth")?;
    Ok(())
}

async fn apply_acl_config(client: &Client, config: &AclConfig) -> Result<()> {
    let mut auth = client.raw().auth_client();

    for role in &config.roles {
        if auth.role_get(&role.name).await.is_ok() {
            auth.role_delete(&role.name)
                .await
                .with_context(|| format!("failed to reset role {:?}", role.name))?;
        }
        auth.role_add(&role.name)
            .await
            .with_context(|| format!("failed to add role {:?}", role.name))?;

        for perm in &role.permissions {
            let mut permission = match perm.mode.to_lowercase().as_str() {
                "read" => Permission::read(perm.key.as_str()),
                "write" => Permission::write(perm.key.as_str()),
                "readwrite" => Permission::read_write(perm.key.as_str()),
                other => return Err(anyhow!("invalid permission mode {:?}", other)),
            };
            if perm.prefix {
                permission = permission.with_prefix();
            }

            auth.role_grant_permission(&role.name, permission)
                .await
                .with_context(|| format!("failed to grant permission on role {:?}", role.name))?;
        }
    }

    for user in &config.users {
        if auth.user_get(&user.name).await.is_ok() {
            auth.user_delete(&user.name)
                .await
                .with_context(|| format!("failed to reset user {:?}", user.name))?;
        }

        let password = user.password.as_deref().unwrap_or_default();
        if password.is_empty() {
            auth.user_add(&user.name, "", Some(UserAddOptions::new().with_no_pwd()))
                .await
                .with_context(|| format!("failed to add user {:?}", user.name))?;
        } else {
            auth.user_add(&user.name, password, None)
                .await
                .with_context(|| format!("failed to add user {:?}", user.name))?;
        }

        for role in &user.roles {
            auth.user_grant_role(&user.name, role)
                .await
                .with_context(|| format!("failed to grant role to user {:?}", user.name))?;
        }
    }

    let blob = serde_yml::to_string(config).context("failed to serialize ACL config")?;
    client
        .put(INIT_ACL_CONFIG_KEY, blob.into_bytes())
        .await
        .context("failed to persist ACL config")?;

    Ok(())
}

async fn remove_acl_config(client: &Client, config: &AclConfig) -> Result<()> {
    let mut auth = client.raw().auth_client();

    for user in &config.users {
        match auth.user_delete(&user.name).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(anyhow!(e).context(format!("failed to delete user {:?}", user.name)))
            }
        }
    }

    for role in &config.roles {
        match auth.role_delete(&role.name).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(anyhow!(e).context(format!("failed to delete role {:?}", role.name)))
            }
        }
    }

    Ok(())
}

async fn read_applied_config(client: &Client) -> Result<Option<AclConfig>> {
    let value = match client.get(INIT_ACL_CONFIG_KEY).await? {
        Some(value) => value,
        None => return Ok(None),
    };

    let config = serde_yml::from_slice(&value).context("failed to parse applied ACL config")?;
    Ok(Some(config))
}

/// Subject common name of the operator's client certificate, which becomes
/// the root-bound identity under certificate authentication.
fn cert_common_name(cert_file: &Path) -> Result<String> {
    let bytes = std::fs::read(cert_file)
        .with_context(|| format!("failed to read certificate {:?}", cert_file))?;

    let block = pem::parse(&bytes).context("failed to decode certificate")?;
    let (_, cert) = x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| anyhow!("failed to parse certificate: {}", e))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| anyhow!("certificate subject has no common name"))?;

    Ok(common_name.to_string())
}

fn is_already_exists(err: &etcd_client::Error) -> bool {
    let message = err.to_string();
    message.contains("already exists") || message.contains("already exist")
}

fn is_not_found(err: &etcd_client::Error) -> bool {
    err.to_string().contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd::{AclPermission, AclRole, AclUser};

    #[test]
    fn test_acl_config_blob_round_trip() {
        let config = AclConfig {
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
        };

        let blob = serde_yml::to_string(&config).unwrap();
        let parsed: AclConfig = serde_yml::from_str(&blob).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_cert_common_name_missing_file() {
        assert!(cert_common_name(Path::new("/nonexistent/cert.pem")).is_err());
    }
}
