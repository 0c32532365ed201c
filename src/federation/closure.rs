//! Follower closure
//!
//! Widens an activity's audience to followers and followers-of-followers of
//! each addressed actor. Exactly two hops, never a fixpoint walk.

use std::collections::HashSet;

use futures::future::join_all;

use super::envelope::Activity;
use super::fetch::RemoteFetcher;

/// Expand `activity.to` in place.
///
/// The sending actor is added to the audience first so its own followers are
/// reached. For every seed `e` (the original `to` plus the sender), each
/// follower `k` of `e` not already present is appended, followed by the
/// followers of `k`. A follower that was already present does not get its
/// second hop walked again. Unreachable collections count as empty.
///
/// Order of first insertion is kept and every URL appears once.
pub async fn expand_recipients(fetcher: &RemoteFetcher, activity: &mut Activity) {
    let mut audience = Audience::new(std::mem::take(&mut activity.to));
    audience.push(activity.actor.id.clone());

    let seeds = audience.members.clone();
    for seed in seeds {
        let followers = followers_of(fetcher, &seed).await;

        let fresh: Vec<String> = followers
            .into_iter()
            .filter(|follower| audience.push(follower.clone()))
            .collect();

        let second_hop = join_all(fresh.iter().map(|follower| followers_of(fetcher, follower))).await;
        for follower_of_follower in second_hop.into_iter().flatten() {
            audience.push(follower_of_follower);
        }
    }

    activity.to = audience.members;
}

async fn followers_of(fetcher: &RemoteFetcher, actor_id: &str) -> Vec<String> {
    if actor_id.is_empty() {
        return Vec::new();
    }

    let url = format!("{}/followers", actor_id.trim_end_matches('/'));
    match fetcher.get_collection(&url).await {
        Ok(collection) => collection.member_ids(),
        Err(e) => {
            tracing::warn!(actor = %actor_id, error = %e, "Follower collection unavailable");
            Vec::new()
        }
    }
}

/// Insertion-ordered set of recipient URLs.
struct Audience {
    members: Vec<String>,
    seen: HashSet<String>,
}

impl Audience {
    fn new(initial: Vec<String>) -> Self {
        let mut audience = Self {
            members: Vec::with_capacity(initial.len()),
            seen: HashSet::new(),
        };
        for id in initial {
            audience.push(id);
        }
        audience
    }

    /// Returns `true` if the URL was new.
    fn push(&mut self, id: String) -> bool {
        if id.is_empty() || self.seen.contains(&id) {
            return false;
        }
        self.seen.insert(id.clone());
        self.members.push(id);
        true
    }
}
