use anyhow::Result;
use nix::unistd::{Uid, User};
use tracing::debug;

use crate::error::Error;

/// Name of the OS user running this process, if it resolves.
pub fn current_user() -> Option<String> {
    user_name(Uid::effective())
}

fn user_name(uid: Uid) -> Option<String> {
    User::from_uid(uid).ok()?.map(|user| user.name)
}

/// Checks the run-as precondition.
///
/// `None` disables the check. Otherwise the effective user must be the
/// expected one; a uid that does not resolve to a name never matches.
pub fn check_run_as(expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match current_user() {
        Some(user) if user == expected => {
            debug!(user = %user, "Run-as precondition satisfied");
            Ok(())
        }
        Some(user) => Err(Error::Precondition(format!(
            "must be run as {}, not {}",
            expected, user
        ))
        .into()),
        None => Err(Error::Precondition(format!(
            "must be run as {}, current user is unknown",
            expected
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_check_always_passes() {
        assert!(check_run_as(None).is_ok());
    }

    #[test]
    fn test_current_user_passes() {
        if let Some(user) = current_user() {
            assert!(check_run_as(Some(&user)).is_ok());
        }
    }

    #[test]
    fn test_other_user_is_a_precondition_error() {
        let err = check_run_as(Some("no-such-user-mailvault")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Precondition(_))
        ));
    }
}
