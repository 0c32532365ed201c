//! Inbound activity processing
//!
//! Every activity posted to a local inbox ends in an `InboxOutcome`. Refusals
//! that are normal federation traffic (unfollowed senders, cache policy,
//! blacklist) are `Dropped`; only faults the peer should hear about are
//! returned as errors.

use chrono::Utc;

use super::Federation;
use super::cache::CacheWrite;
use super::envelope::{Activity, Object};
use super::ident::actor_id_from_object_id;
use super::signature::verify_request;
use crate::data::{Actor, ObjectOrigin};
use crate::error::AppError;
use crate::metrics::INBOX_ACTIVITIES_TOTAL;

/// What happened to an inbound activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// A new post was mirrored
    Persisted,
    /// The post was already stored; redelivery is a no-op
    Duplicate,
    /// A follow, accept or delete changed local state
    Applied,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAddressedLocally,
    LocalSender,
    NotFollowing,
    CachePolicy,
    Blacklisted,
    SelfFollow,
    NotOwner,
    NoChange,
    Unsupported,
}

impl InboxOutcome {
    fn label(self) -> &'static str {
        match self {
            InboxOutcome::Persisted => "persisted",
            InboxOutcome::Duplicate => "duplicate",
            InboxOutcome::Applied => "applied",
            InboxOutcome::Dropped(reason) => match reason {
                DropReason::NotAddressedLocally => "not_addressed",
                DropReason::LocalSender => "local_sender",
                DropReason::NotFollowing => "not_following",
                DropReason::CachePolicy => "cache_policy",
                DropReason::Blacklisted => "blacklisted",
                DropReason::SelfFollow => "self_follow",
                DropReason::NotOwner => "not_owner",
                DropReason::NoChange => "no_change",
                DropReason::Unsupported => "unsupported",
            },
        }
    }
}

impl Federation {
    /// Resolve the claimed sender and check the request signature against it.
    ///
    /// # Errors
    /// `AppError::Authentication` when the actor cannot be resolved or the
    /// signature does not verify. Store faults propagate unchanged.
    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        claimed_actor: &str,
    ) -> Result<Actor, AppError> {
        let actor = match self.resolver.resolve(claimed_actor).await {
            Ok(actor) => actor,
            Err(AppError::Persistence(e)) => return Err(AppError::Persistence(e)),
            Err(e) => {
                tracing::debug!(actor = %claimed_actor, error = %e, "Cannot resolve signer");
                return Err(AppError::Authentication);
            }
        };

        if actor.id != claimed_actor {
            tracing::debug!(actor = %claimed_actor, resolved = %actor.id, "Signer resolved to another actor");
            return Err(AppError::Authentication);
        }

        verify_request(method, path, headers, Some(body), &actor, self.replay_window)?;
        Ok(actor)
    }

    /// Apply an authenticated activity addressed to `local`.
    pub async fn process_activity(
        &self,
        local: &Actor,
        activity: Activity,
    ) -> Result<InboxOutcome, AppError> {
        let kind = activity.kind.clone();

        let result = match kind.as_str() {
            "Create" => self.process_create(local, activity).await,
            "Follow" => self.handle_follow(local, activity).await,
            "Accept" if is_follow_answer(&activity) => self.handle_accept(local, activity).await,
            "Reject" => {
                tracing::info!(
                    actor = %local.id,
                    remote = %activity.actor.id,
                    "Follow rejected by remote"
                );
                Ok(InboxOutcome::Applied)
            }
            "Delete" => self.handle_delete(activity).await,
            _ => Ok(InboxOutcome::Dropped(DropReason::Unsupported)),
        };

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.kind(),
        };
        INBOX_ACTIVITIES_TOTAL
            .with_label_values(&[kind.as_str(), label])
            .inc();

        result
    }

    async fn process_create(
        &self,
        local: &Actor,
        activity: Activity,
    ) -> Result<InboxOutcome, AppError> {
        if !self.resolver.is_local(&local.id).await? {
            return Ok(InboxOutcome::Dropped(DropReason::NotAddressedLocally));
        }
        let remote = activity.actor.id.clone();
        if self.resolver.is_local(&remote).await? {
            return Ok(InboxOutcome::Dropped(DropReason::LocalSender));
        }

        let mut object = activity.object;
        if object.id.is_empty() {
            return Err(AppError::Validation("Create carries no object id".to_string()));
        }
        if object.actor.is_empty() {
            object.actor = remote.clone();
        }

        if !self.store.is_following(&local.id, &remote).await? {
            tracing::debug!(actor = %local.id, remote = %remote, "Ignoring post from unfollowed actor");
            return Ok(InboxOutcome::Dropped(DropReason::NotFollowing));
        }

        self.backfill_context(local, &object).await?;

        let remote_copy = self.fetcher.get_collection(&object.id).await?;
        if remote_copy.members().is_empty() {
            return Err(AppError::Validation(format!(
                "object {} does not exist on its origin",
                object.id
            )));
        }

        if let Some(parent) = object.parent_id() {
            if self.store.is_locked(parent).await? {
                return Err(AppError::Validation("thread locked".to_string()));
            }
        }

        if !self.want_to_cache(local, &object).await? {
            tracing::debug!(actor = %local.id, post = %object.id, "Post outside cache policy");
            return Ok(InboxOutcome::Dropped(DropReason::CachePolicy));
        }

        if self.store.object_exists(&object.id).await? {
            return Ok(InboxOutcome::Duplicate);
        }

        match self.cache.write_cache(&object).await? {
            CacheWrite::Written => {}
            CacheWrite::Exists => return Ok(InboxOutcome::Duplicate),
            CacheWrite::Blacklisted => return Ok(InboxOutcome::Dropped(DropReason::Blacklisted)),
        }

        if let Err(e) = self.archiver.archive_posts(local).await {
            tracing::warn!(actor = %local.id, error = %e, "Archival rotation failed");
        }

        let notifier = self.notifier.clone();
        let board = local.clone();
        tokio::spawn(async move {
            notifier.post_received(&board, &object).await;
        });

        Ok(InboxOutcome::Persisted)
    }

    /// Fetch parents we do not have yet, but only from boards we follow.
    async fn backfill_context(&self, local: &Actor, object: &Object) -> Result<(), AppError> {
        for parent in &object.in_reply_to {
            if parent.id.is_empty() || self.store.object_exists(&parent.id).await? {
                continue;
            }

            let owner = actor_id_from_object_id(&parent.id);
            if !self.store.is_following(&local.id, &owner).await? {
                continue;
            }

            let thread = self
                .fetcher
                .get_collection(&parent.id)
                .await
                .map_err(|e| AppError::Validation(format!("cannot fetch {}: {e}", parent.id)))?;
            if thread.members().is_empty() {
                return Err(AppError::Validation(format!(
                    "context {} is unavailable",
                    parent.id
                )));
            }

            for post in thread.members() {
                self.cache.write_cache(post).await?;
            }
            tracing::debug!(actor = %local.id, parent = %parent.id, "Backfilled thread context");
        }
        Ok(())
    }

    /// Cache a remote post when `local` is among its author's followers, or
    /// when it is a reply and the thread root's author is followed by both
    /// the post's author and `local`.
    async fn want_to_cache(&self, local: &Actor, object: &Object) -> Result<bool, AppError> {
        let followers = self
            .fetcher
            .get_collection(&format!("{}/followers", object.actor))
            .await?
            .member_ids();
        if followers.iter().any(|id| *id == local.id) {
            return Ok(true);
        }

        let Some(root) = object.parent_id() else {
            return Ok(false);
        };
        let root_author = actor_id_from_object_id(root);
        if !self.store.is_following(&local.id, &root_author).await? {
            return Ok(false);
        }

        let following = self
            .fetcher
            .get_collection(&format!("{}/following", object.actor))
            .await?
            .member_ids();
        Ok(following.iter().any(|id| *id == root_author))
    }

    async fn handle_delete(&self, activity: Activity) -> Result<InboxOutcome, AppError> {
        let id = &activity.object.id;
        if id.is_empty() || actor_id_from_object_id(id) != activity.actor.id {
            return Ok(InboxOutcome::Dropped(DropReason::NotOwner));
        }

        match self.store.get_object(id).await? {
            Some(record) if record.origin == ObjectOrigin::Cache => {
                self.store.tombstone(id, Utc::now()).await?;
                tracing::info!(post = %id, actor = %activity.actor.id, "Remote post deleted");
                Ok(InboxOutcome::Applied)
            }
            _ => Ok(InboxOutcome::Dropped(DropReason::NoChange)),
        }
    }
}

fn is_follow_answer(activity: &Activity) -> bool {
    activity.object.kind == "Follow"
        || activity
            .object
            .object
            .as_ref()
            .is_some_and(|inner| inner.kind == "Follow")
}
