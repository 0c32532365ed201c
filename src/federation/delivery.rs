//! Activity delivery
//!
//! One detached task per recipient. Each task makes up to `max_attempts`
//! POSTs, sleeping `attempt × backoff_unit` before each one and re-signing
//! with a fresh `Date` every time. The dispatcher waits `spacing` between
//! starting recipients. Callers never wait on any of it; the returned
//! `DeliveryBatch` may be dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rsa::RsaPrivateKey;
use tokio::task::JoinHandle;

use super::closure::expand_recipients;
use super::envelope::{ACTIVITY_CONTENT_TYPE, Activity};
use super::fetch::RemoteFetcher;
use super::ident::is_main_actor_id;
use super::keys::KeyStore;
use super::resolver::ActorResolver;
use super::signature::sign_request;
use crate::config::FederationConfig;
use crate::data::Actor;
use crate::error::AppError;
use crate::metrics::{DELIVERIES_IN_FLIGHT, DELIVERY_ATTEMPTS_TOTAL};

/// Retry schedule for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear backoff step
    pub backoff_unit: Duration,
    /// Pause between scheduling successive recipients
    pub spacing: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_unit: config.backoff_unit(),
            spacing: config.spacing(),
        }
    }

    /// Sleep before the zero-based `attempt`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// How a single recipient's delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Peer answered 200
    Delivered { attempts: u32 },
    /// Every attempt failed
    Abandoned { attempts: u32 },
    /// No usable key for the sender; nothing was sent
    SigningFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub target: String,
    pub outcome: DeliveryOutcome,
}

/// Handle on a detached fan-out.
pub struct DeliveryBatch {
    /// Endpoints that were scheduled, in order
    pub targets: Vec<String>,
    handle: JoinHandle<Vec<DeliveryReport>>,
}

impl DeliveryBatch {
    /// Wait for every recipient task. Only tests and tooling need this.
    pub async fn finished(self) -> Vec<DeliveryReport> {
        self.handle.await.unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct DeliveryEngine {
    client: reqwest::Client,
    keys: Arc<KeyStore>,
    resolver: Arc<ActorResolver>,
    policy: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(
        client: reqwest::Client,
        keys: Arc<KeyStore>,
        resolver: Arc<ActorResolver>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            keys,
            resolver,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver to the inbox of every actor in `activity.to`.
    ///
    /// Skips the sender, instance-level actors, and actors known to be
    /// read-only. Unknown actors get `<id>/inbox`.
    pub async fn deliver(&self, sender: &Actor, activity: &Activity) -> Result<DeliveryBatch, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {e}")))?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for recipient in &activity.to {
            if recipient.is_empty() || *recipient == sender.id || is_main_actor_id(recipient) {
                continue;
            }

            let inbox = match self.resolver.known(recipient).await? {
                Some(actor) if actor.is_read_only() => {
                    tracing::debug!(recipient = %recipient, "Skipping read-only recipient");
                    continue;
                }
                Some(actor) => actor.inbox_url(),
                None => format!("{}/inbox", recipient.trim_end_matches('/')),
            };

            if seen.insert(inbox.clone()) {
                targets.push(inbox);
            }
        }

        tracing::info!(
            actor = %sender.id,
            activity_type = %activity.kind,
            recipients = targets.len(),
            "Scheduling delivery"
        );

        Ok(self.spawn(sender.clone(), targets, body))
    }

    /// Widen the audience with the follower closure, then deliver.
    ///
    /// The closure walk happens inside the detached task, so the caller is
    /// back before any peer is asked for a collection. `targets` of the
    /// returned batch is empty; the reports name every endpoint tried.
    pub fn deliver_expanded(
        &self,
        sender: &Actor,
        activity: Activity,
        fetcher: RemoteFetcher,
    ) -> DeliveryBatch {
        let engine = self.clone();
        let sender = sender.clone();

        let handle = tokio::spawn(async move {
            let mut activity = activity;
            expand_recipients(&fetcher, &mut activity).await;

            match engine.deliver(&sender, &activity).await {
                Ok(batch) => batch.finished().await,
                Err(e) => {
                    tracing::warn!(actor = %sender.id, error = %e, "Cannot schedule delivery");
                    Vec::new()
                }
            }
        });

        DeliveryBatch {
            targets: Vec::new(),
            handle,
        }
    }

    /// Post to the sender's own outbox, e.g. a Follow for a remote board.
    pub fn deliver_to_outbox(&self, sender: &Actor, activity: &Activity) -> Result<DeliveryBatch, AppError> {
        if sender.outbox.is_empty() {
            return Err(AppError::Validation(format!(
                "actor {} has no outbox",
                sender.id
            )));
        }

        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {e}")))?;

        Ok(self.spawn(sender.clone(), vec![sender.outbox.clone()], body))
    }

    fn spawn(&self, sender: Actor, targets: Vec<String>, body: Vec<u8>) -> DeliveryBatch {
        let engine = self.clone();
        let body = Arc::new(body);
        let scheduled = targets.clone();

        let handle = tokio::spawn(async move {
            let sender = Arc::new(sender);
            let mut tasks = Vec::with_capacity(targets.len());

            for (index, target) in targets.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(engine.policy.spacing).await;
                }

                let engine = engine.clone();
                let sender = sender.clone();
                let body = body.clone();
                tasks.push(tokio::spawn(async move {
                    let outcome = engine.deliver_one(&sender, &target, &body).await;
                    DeliveryReport { target, outcome }
                }));
            }

            join_all(tasks)
                .await
                .into_iter()
                .filter_map(Result::ok)
                .collect()
        });

        DeliveryBatch {
            targets: scheduled,
            handle,
        }
    }

    async fn deliver_one(&self, sender: &Actor, target: &str, body: &[u8]) -> DeliveryOutcome {
        DELIVERIES_IN_FLIGHT.inc();
        let outcome = self.attempt_all(sender, target, body).await;
        DELIVERIES_IN_FLIGHT.dec();

        match &outcome {
            DeliveryOutcome::Delivered { attempts } => {
                tracing::info!(actor = %sender.id, target, attempts, "Delivered activity");
            }
            DeliveryOutcome::Abandoned { attempts } => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["abandoned"]).inc();
                tracing::warn!(actor = %sender.id, target, attempts, "Giving up on delivery");
            }
            DeliveryOutcome::SigningFailed => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["signing_failed"]).inc();
            }
        }
        outcome
    }

    async fn attempt_all(&self, sender: &Actor, target: &str, body: &[u8]) -> DeliveryOutcome {
        let Ok(private_key) = self.keys.private_key_for(sender).await else {
            return DeliveryOutcome::SigningFailed;
        };
        let Some(key_id) = sender.public_key_id() else {
            return DeliveryOutcome::SigningFailed;
        };

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.post_signed(&private_key, key_id, target, body).await {
                Ok(status) if status == reqwest::StatusCode::OK => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["delivered"]).inc();
                    return DeliveryOutcome::Delivered {
                        attempts: attempt + 1,
                    };
                }
                Ok(status) => {
                    tracing::debug!(target, attempt, %status, "Delivery refused");
                }
                Err(AppError::Validation(reason)) => {
                    tracing::warn!(target, %reason, "Cannot sign request for target");
                    return DeliveryOutcome::SigningFailed;
                }
                Err(e) => {
                    tracing::debug!(target, attempt, error = %e, "Delivery failed");
                }
            }
            DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["retry"]).inc();
        }

        DeliveryOutcome::Abandoned {
            attempts: self.policy.max_attempts,
        }
    }

    async fn post_signed(
        &self,
        private_key: &RsaPrivateKey,
        key_id: &str,
        target: &str,
        body: &[u8],
    ) -> Result<reqwest::StatusCode, AppError> {
        let signed = sign_request("POST", target, Some(body), private_key, key_id)?;

        let mut request = self
            .client
            .post(target)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", signed.date)
            .header("Signature", signed.signature);

        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(format!("POST {target}: {e}")))?;

        Ok(response.status())
    }
}

/// Outbound activity constructors.
pub mod builder {
    use chrono::Utc;

    use crate::data::Actor;
    use crate::federation::envelope::{ACTIVITY_STREAMS, Activity, Object};

    fn activity(kind: &str, actor: Actor, object: Object, to: Vec<String>) -> Activity {
        Activity {
            context: ACTIVITY_STREAMS.to_string(),
            kind: kind.to_string(),
            actor,
            object,
            to,
            ..Default::default()
        }
    }

    fn id_only(id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// `actor` asks to follow `target`.
    pub fn follow(actor: &Actor, target: &str) -> Activity {
        activity(
            "Follow",
            actor.clone(),
            Object {
                id: target.to_string(),
                actor: target.to_string(),
                ..Default::default()
            },
            vec![target.to_string()],
        )
    }

    fn follow_answer(kind: &str, followed: &str, follower: &str, summary: String) -> Activity {
        let mut answer = activity(
            kind,
            id_only(followed),
            Object {
                actor: follower.to_string(),
                object: Some(Box::new(Object {
                    kind: "Follow".to_string(),
                    actor: followed.to_string(),
                    ..Default::default()
                })),
                ..Default::default()
            },
            vec![follower.to_string()],
        );
        answer.summary = summary;
        answer
    }

    /// Answer to `follow`, sent by the followed actor. `unfollow` picks the summary.
    pub fn accept_follow(follow: &Activity, unfollow: bool) -> Activity {
        let follower = &follow.actor.id;
        let followed = &follow.object.actor;
        let verb = if unfollow { "Unfollow" } else { "Follow" };
        follow_answer(
            "Accept",
            followed,
            follower,
            format!("{follower} {verb} {followed}"),
        )
    }

    pub fn reject_follow(follow: &Activity) -> Activity {
        follow_answer(
            "Reject",
            &follow.object.actor,
            &follow.actor.id,
            String::new(),
        )
    }

    /// Wrap a post. The author is never among its own recipients.
    pub fn create(actor: &Actor, object: Object) -> Activity {
        let to = object
            .to
            .iter()
            .filter(|id| **id != object.actor)
            .cloned()
            .collect();
        let cc = object
            .cc
            .iter()
            .filter(|id| **id != object.actor)
            .cloned()
            .collect();

        let mut create = activity("Create", actor.clone(), Object::default(), to);
        create.cc = cc;
        create.published = object.published;
        create.object = object;
        create
    }

    pub fn delete(actor: &Actor, object_id: &str, to: Vec<String>) -> Activity {
        let mut delete = activity(
            "Delete",
            actor.clone(),
            Object {
                kind: "Tombstone".to_string(),
                id: object_id.to_string(),
                actor: actor.id.clone(),
                ..Default::default()
            },
            to,
        );
        delete.published = Some(Utc::now());
        delete
    }
}
