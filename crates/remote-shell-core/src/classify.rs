//! Transport fault classification.
//!
//! Pure functions from a reported fault to the error taxonomy. Whether a
//! lost-connection fault actually transitions a session is decided by the
//! session, which knows its current status.

use crate::{
    AuthorizationMethod, ConnectError, ErrorClass, FaultCode, Remediation, TransportError,
};

/// Fault codes that indicate a dropped connection rather than a fatal failure.
pub const LOST_CONNECTION_FAULTS: [FaultCode; 3] = [
    FaultCode::SocketSend,
    FaultCode::SocketRecv,
    FaultCode::SocketTimeout,
];

const OS_LOGIN_HELP_URL: &str =
    "https://cloud.google.com/compute/docs/oslogin/set-up-oslogin#configure_users";
const METADATA_KEYS_HELP_URL: &str =
    "https://cloud.google.com/compute/docs/connect/add-ssh-keys#metadata";

/// Classify a transport fault.
#[must_use]
pub fn classify(fault: &TransportError) -> ErrorClass {
    match fault.code {
        code if LOST_CONNECTION_FAULTS.contains(&code) => ErrorClass::LostConnection,
        FaultCode::AuthenticationFailed | FaultCode::PublickeyUnverified => {
            ErrorClass::AuthorizationDenied
        }
        _ => ErrorClass::TransportFault,
    }
}

/// Translate a fault into a `ConnectError` of the given class.
#[must_use]
pub fn translate(
    fault: TransportError,
    class: ErrorClass,
    method: AuthorizationMethod,
) -> ConnectError {
    match class {
        ErrorClass::LostConnection => ConnectError::TransientConnectionLoss(fault),
        ErrorClass::AuthorizationDenied => ConnectError::AuthorizationDenied {
            remediation: remediation_for(method),
            source: fault,
        },
        ErrorClass::TransportFault => ConnectError::TransportFault(fault),
    }
}

/// Translate a fault that ended a connect attempt.
///
/// Nothing was established yet, so lost-connection codes are plain faults.
#[must_use]
pub fn translate_connect_failure(
    fault: TransportError,
    method: AuthorizationMethod,
) -> ConnectError {
    let class = match classify(&fault) {
        ErrorClass::LostConnection => ErrorClass::TransportFault,
        other => other,
    };
    translate(fault, class, method)
}

fn remediation_for(method: AuthorizationMethod) -> Remediation {
    match method {
        AuthorizationMethod::OsLogin => Remediation {
            summary: "You do not have sufficient permissions to access this VM instance."
                .to_string(),
            steps: vec![
                "Grant 'Compute OS Login' or 'Compute OS Admin Login'".to_string(),
                "Grant 'Service Account User' if the VM runs as a service account".to_string(),
                "Grant 'Compute OS Login External User' if the VM belongs to a different organization"
                    .to_string(),
            ],
            help_url: OS_LOGIN_HELP_URL.to_string(),
        },
        AuthorizationMethod::InstanceMetadata | AuthorizationMethod::ProjectMetadata => {
            Remediation {
                summary: "The VM instance rejected the published key.".to_string(),
                steps: vec![
                    "Wait for the guest agent to pick up the key, then reconnect".to_string(),
                    "Verify that the instance does not block project-wide keys".to_string(),
                ],
                help_url: METADATA_KEYS_HELP_URL.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(code: FaultCode) -> TransportError {
        TransportError::new(code, "test fault")
    }

    #[test]
    fn test_lost_connection_codes() {
        for code in LOST_CONNECTION_FAULTS {
            assert_eq!(classify(&fault(code)), ErrorClass::LostConnection);
        }
    }

    #[test]
    fn test_authentication_codes() {
        assert_eq!(
            classify(&fault(FaultCode::AuthenticationFailed)),
            ErrorClass::AuthorizationDenied
        );
        assert_eq!(
            classify(&fault(FaultCode::PublickeyUnverified)),
            ErrorClass::AuthorizationDenied
        );
    }

    #[test]
    fn test_other_codes_are_transport_faults() {
        for code in [
            FaultCode::KexFailure,
            FaultCode::Timeout,
            FaultCode::SocketDisconnect,
            FaultCode::ChannelFailure,
            FaultCode::Other(-1),
        ] {
            assert_eq!(classify(&fault(code)), ErrorClass::TransportFault);
        }
    }

    #[test]
    fn test_os_login_remediation_names_roles() {
        let err = translate(
            fault(FaultCode::AuthenticationFailed),
            ErrorClass::AuthorizationDenied,
            AuthorizationMethod::OsLogin,
        );
        let remediation = err.remediation().unwrap();
        assert_eq!(remediation.help_url, OS_LOGIN_HELP_URL);
        assert!(remediation.steps.iter().any(|s| s.contains("OS Admin Login")));
        assert_eq!(err.transport_error().unwrap().code, FaultCode::AuthenticationFailed);
    }

    #[test]
    fn test_connect_failure_never_reports_lost_connection() {
        let err = translate_connect_failure(
            fault(FaultCode::SocketRecv),
            AuthorizationMethod::InstanceMetadata,
        );
        assert_eq!(err.class(), Some(ErrorClass::TransportFault));

        let err = translate_connect_failure(
            fault(FaultCode::AuthenticationFailed),
            AuthorizationMethod::InstanceMetadata,
        );
        assert_eq!(err.class(), Some(ErrorClass::AuthorizationDenied));
        assert_eq!(err.remediation().unwrap().help_url, METADATA_KEYS_HELP_URL);
    }
}
