//! Fatal errors with their process exit codes.
//!
//! Two severities exist in clawboot: best-effort steps report a
//! `StepOutcome` and never land here; everything else is fatal and carries
//! the exit code the operator contract promises.

/// Required precondition or runtime failure.
pub const EXIT_FAILURE: i32 = 1;
/// Missing required configuration; the deployment itself is wrong.
pub const EXIT_MISCONFIGURED: i32 = 2;

#[derive(Debug)]
pub struct Fatal {
    pub exit_code: i32,
    pub source: anyhow::Error,
}

impl Fatal {
    pub fn failure(source: impl Into<anyhow::Error>) -> Self {
        Self {
            exit_code: EXIT_FAILURE,
            source: source.into(),
        }
    }

    pub fn misconfigured(source: impl Into<anyhow::Error>) -> Self {
        Self {
            exit_code: EXIT_MISCONFIGURED,
            source: source.into(),
        }
    }
}

/// Plain `?` on anyhow results means exit code 1.
impl From<anyhow::Error> for Fatal {
    fn from(source: anyhow::Error) -> Self {
        Self::failure(source)
    }
}

impl From<boot_vault::VaultError> for Fatal {
    fn from(err: boot_vault::VaultError) -> Self {
        if err.is_misconfiguration() {
            Self::misconfigured(err)
        } else {
            Self::failure(err)
        }
    }
}

impl From<boot_deploy::DeployError> for Fatal {
    fn from(err: boot_deploy::DeployError) -> Self {
        if err.is_misconfiguration() {
            Self::misconfigured(err)
        } else {
            Self::failure(err)
        }
    }
}

impl From<boot_env::PreconditionError> for Fatal {
    fn from(err: boot_env::PreconditionError) -> Self {
        Self::failure(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_misconfiguration_maps_to_exit_2() {
        let fatal = Fatal::from(boot_vault::VaultError::MissingAuth);
        assert_eq!(fatal.exit_code, EXIT_MISCONFIGURED);

        let fatal = Fatal::from(boot_vault::VaultError::MalformedResponse("x".into()));
        assert_eq!(fatal.exit_code, EXIT_FAILURE);
    }

    #[test]
    fn test_deploy_errors_map_to_contracted_codes() {
        let fatal = Fatal::from(boot_deploy::DeployError::MissingResourceUuid);
        assert_eq!(fatal.exit_code, EXIT_MISCONFIGURED);

        let fatal = Fatal::from(boot_deploy::DeployError::LatestUnknown("offline".into()));
        assert_eq!(fatal.exit_code, EXIT_FAILURE);
    }

    #[test]
    fn test_precondition_errors_map_to_exit_1() {
        let fatal = Fatal::from(boot_env::PreconditionError::MissingGatewayToken);
        assert_eq!(fatal.exit_code, EXIT_FAILURE);
        let fatal = Fatal::from(boot_env::PreconditionError::NoProviderCredential);
        assert_eq!(fatal.exit_code, EXIT_FAILURE);
    }
}
