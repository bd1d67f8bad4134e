//! Remote module resolution

use rmem_connect::{ConnectError, Operation, Reply};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::remote_object::{ConnectionSource, RemoteObject};
use crate::error::{Result, RmemError};

const BUILTINS: &str = "builtins";

/// Resolves module names to namespace handles on the endpoint
///
/// Nothing is cached: each call goes through the current connection, so a
/// resolver keeps working across reconnects.
#[derive(Clone)]
pub struct RemoteModule {
    source: Arc<dyn ConnectionSource>,
}

impl RemoteModule {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self { source }
    }

    /// Namespace for `module`, or the builtins namespace for `None`
    ///
    /// A name is first looked up as an attribute of builtins and only then
    /// imported on the remote side.
    pub fn resolve(&self, module: Option<&str>) -> Result<RemoteObject> {
        let guardian = self.source.connection()?;
        let builtins = guardian
            .remote_import(BUILTINS)
            .map_err(|e| resolution_error(BUILTINS, e))?;

        let name = match module {
            None => return Ok(RemoteObject::new(Arc::clone(&self.source), builtins)),
            Some(name) => name,
        };

        match guardian.invoke(&builtins, Operation::GetAttr(name.to_string())) {
            Ok(Reply::Ref(found)) => {
                debug!("Resolved '{}' from builtins", name);
                return Ok(RemoteObject::new(Arc::clone(&self.source), found));
            }
            Ok(_) | Err(ConnectError::Remote(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let imported = guardian
            .remote_import(name)
            .map_err(|e| resolution_error(name, e))?;
        debug!("Imported remote module '{}'", name);
        Ok(RemoteObject::new(Arc::clone(&self.source), imported))
    }

    /// Like [`resolve`](Self::resolve), with leading dots in `module` taken
    /// relative to `package`
    pub fn resolve_in(&self, module: &str, package: Option<&str>) -> Result<RemoteObject> {
        let name = absolute_name(module, package)?;
        self.resolve(Some(&name))
    }
}

/// Absolute module name for a possibly relative `name`
///
/// Each leading dot past the first climbs one package up from `package`.
pub fn absolute_name(name: &str, package: Option<&str>) -> Result<String> {
    let rest = name.trim_start_matches('.');
    let level = name.len() - rest.len();
    if level == 0 {
        return Ok(name.to_string());
    }

    let package = match package {
        Some(package) if !package.is_empty() => package,
        _ => {
            return Err(RmemError::Resolution {
                module: name.to_string(),
                reason: format!(
                    "the 'package' argument is required to perform a relative import for '{}'",
                    name
                ),
            })
        }
    };

    let bits: Vec<&str> = package.rsplitn(level, '.').collect();
    let base = match bits.last() {
        Some(base) if bits.len() == level => *base,
        _ => {
            return Err(RmemError::Resolution {
                module: name.to_string(),
                reason: "attempted relative import beyond top-level package".to_string(),
            })
        }
    };

    Ok(if rest.is_empty() {
        base.to_string()
    } else {
        format!("{}.{}", base, rest)
    })
}

/// Remote failures become resolution errors; connection failures keep their class
fn resolution_error(module: &str, err: ConnectError) -> RmemError {
    match err {
        ConnectError::Remote(remote) => RmemError::Resolution {
            module: module.to_string(),
            reason: remote.to_string(),
        },
        other => other.into(),
    }
}

impl fmt::Debug for RemoteModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteModule").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_names_pass_through() {
        assert_eq!(absolute_name("threading", None).unwrap(), "threading");
        assert_eq!(absolute_name("os.path", Some("pkg")).unwrap(), "os.path");
    }

    #[test]
    fn test_relative_names_climb_the_package() {
        assert_eq!(absolute_name(".", Some("threading")).unwrap(), "threading");
        assert_eq!(absolute_name(".jobs", Some("app.workers")).unwrap(), "app.workers.jobs");
        assert_eq!(absolute_name("..jobs", Some("app.workers")).unwrap(), "app.jobs");
        assert_eq!(absolute_name("..", Some("app.workers")).unwrap(), "app");
    }

    #[test]
    fn test_relative_name_errors() {
        match absolute_name(".jobs", None).unwrap_err() {
            RmemError::Resolution { module, reason } => {
                assert_eq!(module, ".jobs");
                assert!(reason.contains("'package' argument is required"));
            }
            other => panic!("unexpected error: {}", other),
        }

        let err = absolute_name("...jobs", Some("app.workers")).unwrap_err();
        assert!(err.to_string().contains("beyond top-level package"));
    }
}
