//! Follow lifecycle: outbound follows, inbound Follow and Accept

use super::Federation;
use super::delivery::{DeliveryBatch, builder};
use super::envelope::Activity;
use super::ident::is_main_actor_id;
use super::inbox::{DropReason, InboxOutcome};
use crate::data::Actor;
use crate::error::AppError;

impl Federation {
    /// Ask `target` (an actor URL or `name@host` handle) to accept `actor`
    /// as a follower. The Follow leaves through the actor's own outbox.
    pub async fn follow(&self, actor: &Actor, target: &str) -> Result<DeliveryBatch, AppError> {
        let target = self.resolver.resolve(target).await?;

        if actor.is_main() && !self.resolver.is_local(&target.id).await? {
            return Err(AppError::PolicyRejection(
                "the main actor only follows local boards".to_string(),
            ));
        }

        let follow = builder::follow(actor, &target.id);
        tracing::info!(actor = %actor.id, target = %target.id, "Sending follow");
        self.delivery.deliver_to_outbox(actor, &follow)
    }

    /// Follow back every follower of `local` it does not follow yet.
    pub async fn auto_follow(&self, local: &Actor) -> Result<usize, AppError> {
        let mut sent = 0;

        for follower in self.store.get_followers(&local.id).await? {
            if follower == local.id
                || is_main_actor_id(&follower)
                || self.store.is_following(&local.id, &follower).await?
            {
                continue;
            }

            match self.follow(local, &follower).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(actor = %local.id, follower = %follower, error = %e, "Auto-follow failed")
                }
            }
        }
        Ok(sent)
    }

    /// A remote actor asks to follow (or stop following) `local`.
    pub(super) async fn handle_follow(
        &self,
        local: &Actor,
        mut activity: Activity,
    ) -> Result<InboxOutcome, AppError> {
        let target = if activity.object.actor.is_empty() {
            activity.object.id.clone()
        } else {
            activity.object.actor.clone()
        };
        if target != local.id {
            return Ok(InboxOutcome::Dropped(DropReason::NotAddressedLocally));
        }
        activity.object.actor = target;

        let follower = activity.actor.id.clone();
        if follower == local.id {
            self.delivery
                .deliver(local, &builder::reject_follow(&activity))
                .await?;
            return Ok(InboxOutcome::Dropped(DropReason::SelfFollow));
        }

        let unfollow = self.store.is_follower(&local.id, &follower).await?;
        if unfollow {
            self.store.remove_follower(&local.id, &follower).await?;
        } else {
            self.store.add_follower(&local.id, &follower).await?;
        }
        tracing::info!(actor = %local.id, follower = %follower, unfollow, "Follow request applied");

        self.delivery
            .deliver(local, &builder::accept_follow(&activity, unfollow))
            .await?;

        if !unfollow && local.auto_subscribe {
            let followed = self.auto_follow(local).await?;
            tracing::debug!(actor = %local.id, followed, "Auto-subscribed to followers");
        }

        Ok(InboxOutcome::Applied)
    }

    /// A remote board answered our Follow. Local following converges to the
    /// remote's follower list.
    pub(super) async fn handle_accept(
        &self,
        local: &Actor,
        activity: Activity,
    ) -> Result<InboxOutcome, AppError> {
        if !activity.object.actor.is_empty() && activity.object.actor != local.id {
            return Ok(InboxOutcome::Dropped(DropReason::NotAddressedLocally));
        }

        let remote = activity.actor.id.clone();
        let followers_url = if activity.actor.followers.is_empty() {
            format!("{remote}/followers")
        } else {
            activity.actor.followers.clone()
        };

        let listed = self
            .fetcher
            .get_collection(&followers_url)
            .await?
            .member_ids()
            .contains(&local.id);
        let already = self.store.is_following(&local.id, &remote).await?;

        match (listed, already) {
            (true, false) => {
                self.store.add_following(&local.id, &remote).await?;
                tracing::info!(actor = %local.id, remote = %remote, "Now following");

                if !self.resolver.is_local(&remote).await? {
                    let cache = self.cache.clone();
                    tokio::spawn(async move {
                        if let Err(e) = cache.cache_actor_outbox(&remote).await {
                            tracing::warn!(remote = %remote, error = %e, "Outbox mirror failed");
                        }
                    });
                }
                Ok(InboxOutcome::Applied)
            }
            (false, true) => {
                self.store.remove_following(&local.id, &remote).await?;
                tracing::info!(actor = %local.id, remote = %remote, "No longer following");

                let cache = self.cache.clone();
                tokio::spawn(async move {
                    if let Err(e) = cache.delete_cache(&remote).await {
                        tracing::warn!(remote = %remote, error = %e, "Dropping cached threads failed");
                    }
                });
                Ok(InboxOutcome::Applied)
            }
            _ => Ok(InboxOutcome::Dropped(DropReason::NoChange)),
        }
    }
}
