//! Replication credentials
//!
//! The primary generates the replication password and publishes it in its
//! own peer record; standbys read it from there.

use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::Result;
use crate::executor::{push_if_changed, CommandRunner, ExecRequest, FileSpec, FileStore};
use crate::pgconf::quote_identifier;
use crate::replication::REPLICATION_USER;
use crate::state::{Relation, Role, KEY_REPLICATION_PASSWORD};

pub const PASSWORD_LENGTH: usize = 48;

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Replication password for this pass.
///
/// On the primary an existing published password is kept, otherwise a new
/// one is generated and published. A standby gets whatever the primary
/// published, which may be nothing yet.
pub async fn replication_password(relation: &Relation, role: &Role) -> Result<Option<String>> {
    match role {
        Role::Primary => {
            if let Some(existing) = relation.own_record().await?.replication_password {
                return Ok(Some(existing));
            }
            let password = generate_password();
            relation.publish(KEY_REPLICATION_PASSWORD, &password).await?;
            tracing::info!("Generated and published a new replication password");
            Ok(Some(password))
        }
        Role::Standby { primary } => {
            // A demoted primary must stop advertising its old password.
            if relation.own_record().await?.replication_password.is_some() {
                relation.directory().delete_own(KEY_REPLICATION_PASSWORD).await?;
                tracing::info!("No longer primary, withdrew the published replication password");
            }
            Ok(primary.as_ref().and_then(|p| p.replication_password.clone()))
        }
    }
}

/// Home directory of a system account
pub fn home_dir(user: &str) -> PathBuf {
    nix::unistd::User::from_name(user)
        .ok()
        .flatten()
        .map(|u| u.dir)
        .unwrap_or_else(|| match user {
            "root" => PathBuf::from("/root"),
            _ => PathBuf::from("/var/lib/postgresql"),
        })
}

pub fn pgpass_contents(password: &str) -> String {
    format!("*:*:*:{}:{}\n", REPLICATION_USER, password)
}

/// Write `.pgpass` for root and the database account. Returns whether any
/// file changed.
pub async fn write_pgpass(files: &dyn FileStore, system_user: &str, password: &str) -> Result<bool> {
    let contents = pgpass_contents(password);
    let mut changed = false;
    for user in ["root", system_user] {
        let path = home_dir(user).join(".pgpass");
        changed |= push_if_changed(files, &path, &contents, &FileSpec::owned_by(user, 0o600)).await?;
    }
    Ok(changed)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// SQL creating the replication role, or resetting its password
pub fn replication_role_sql(password: &str) -> String {
    let role = quote_identifier(REPLICATION_USER);
    let password = quote_literal(password);
    format!(
        "DO $$BEGIN \
         IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN \
         CREATE ROLE {role} WITH LOGIN REPLICATION PASSWORD {password}; \
         ELSE \
         ALTER ROLE {role} WITH LOGIN REPLICATION PASSWORD {password}; \
         END IF; \
         END$$;",
        name = quote_literal(REPLICATION_USER),
        role = role,
        password = password,
    )
}

/// Ensure the replication role exists on the primary with `password`.
///
/// Runs as root over the local socket; the `juju_charm` ident map lets
/// root in as the superuser. The statement goes to psql on stdin so the
/// password never shows up in the process list. Failures are logged and
/// retried on the next pass.
pub async fn ensure_replication_role(runner: &dyn CommandRunner, password: &str) -> bool {
    let request = ExecRequest::new(["psql", "-U", "postgres", "-d", "postgres", "-v", "ON_ERROR_STOP=1", "-qAt", "-f", "-"])
        .stdin(replication_role_sql(password));

    match runner.run(&request).await.and_then(|out| out.check(&request)) {
        Ok(_) => {
            tracing::debug!("Replication role {} is in place", REPLICATION_USER);
            true
        }
        Err(e) => {
            let message = e.to_string().replace(password, "********");
            tracing::warn!("Could not provision replication role {}: {}", REPLICATION_USER, message);
            false
        }
    }
}
