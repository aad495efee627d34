//! Create-or-update routine shared by the webhook and sweep paths.

use crate::directory::{DirectoryError, User, UserDirectory};
use crate::identity_provider::{ExternalAccount, ProviderUser};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Created(User),
    /// External ID migrated, a profile field changed, or a social account
    /// was newly linked
    Updated(User),
    Unchanged(User),
    /// Nothing written
    Skipped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Bring the local record for `provider_user` in line with the provider.
///
/// Role and tier are never written. A user without a resolvable primary
/// email is skipped.
pub async fn sync_provider_user(
    directory: &dyn UserDirectory,
    provider_user: &ProviderUser,
) -> Result<SyncOutcome, SyncError> {
    let Some(email) = provider_user.primary_email() else {
        tracing::warn!(
            external_id = %provider_user.id,
            "Provider user has no primary email, skipping"
        );
        return Ok(SyncOutcome::Skipped("no primary email".to_string()));
    };

    let profile = provider_user.profile_update();
    let found = directory
        .find_or_create(&provider_user.id, email, &profile)
        .await?;
    let created = found.created;
    let mut changed = found.migrated;

    let synced = directory.apply_profile_update(&found.user, &profile).await?;
    changed |= synced.changed;

    let (user, linked) =
        link_external_accounts(directory, synced.user, &provider_user.external_accounts).await?;
    changed |= linked;

    Ok(if created {
        SyncOutcome::Created(user)
    } else if changed {
        SyncOutcome::Updated(user)
    } else {
        SyncOutcome::Unchanged(user)
    })
}

/// Link every usable account to `user`. Returns the refreshed user and
/// whether any link was new.
///
/// Accounts without a provider user ID are logged and left out; the rest
/// are still linked.
pub async fn link_external_accounts(
    directory: &dyn UserDirectory,
    mut user: User,
    accounts: &[ExternalAccount],
) -> Result<(User, bool), DirectoryError> {
    let mut changed = false;

    for account in accounts {
        let Some(link) = account.to_social_link() else {
            tracing::warn!(
                user_id = %user.id,
                provider = %account.provider,
                account_id = %account.id,
                "External account has no provider user ID, not linking"
            );
            continue;
        };

        let linked = directory.link_social_account(&user, &link).await?;
        changed |= linked.changed;
        user = linked.user;
    }

    Ok((user, changed))
}
