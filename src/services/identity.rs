//! Identity and billing collaborators.
//!
//! The story engine never performs sign-in or payment itself. It consumes the
//! current identity, a stream of identity changes, and a subscription flag.

use crate::core::config::AccountConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::info;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::watch;
use url::Url;

pub trait AuthSession: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    /// Yields the new identity (or `None` on sign-out) after every change.
    fn subscribe(&self) -> BoxStream<'static, Option<String>>;
}

#[async_trait]
pub trait BillingCollaborator: Send + Sync {
    async fn is_subscribed(&self, user_id: &str) -> Result<bool>;

    /// Starts a checkout and returns the URL the reader should visit.
    async fn start_checkout(&self, user_id: &str) -> Result<String>;
}

/// Identity held in process, switched explicitly by the front end.
pub struct LocalAuthSession {
    tx: watch::Sender<Option<String>>,
}

impl LocalAuthSession {
    pub fn new(user_id: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(user_id);
        Self { tx }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        info!("Signed in as {}", user_id);
        self.tx.send_replace(Some(user_id));
    }

    pub fn sign_out(&self) {
        info!("Signed out");
        self.tx.send_replace(None);
    }
}

impl AuthSession for LocalAuthSession {
    fn current_user_id(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> BoxStream<'static, Option<String>> {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let user = rx.borrow_and_update().clone();
            Some((user, rx))
        })
        .boxed()
    }
}

/// Subscription state seeded from the config file.
pub struct ConfigBilling {
    subscribed: Mutex<HashSet<String>>,
    checkout_url: String,
}

impl ConfigBilling {
    pub fn new(account: &AccountConfig) -> Self {
        Self {
            subscribed: Mutex::new(account.subscribed_users.iter().cloned().collect()),
            checkout_url: account.checkout_url.clone(),
        }
    }

    /// Records a completed checkout.
    pub fn mark_subscribed(&self, user_id: &str) -> Result<()> {
        self.subscribed
            .lock()
            .map_err(|_| anyhow!("billing lock poisoned"))?
            .insert(user_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl BillingCollaborator for ConfigBilling {
    async fn is_subscribed(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .subscribed
            .lock()
            .map_err(|_| anyhow!("billing lock poisoned"))?
            .contains(user_id))
    }

    async fn start_checkout(&self, user_id: &str) -> Result<String> {
        let mut url = Url::parse(&self.checkout_url)?;
        url.query_pairs_mut()
            .append_pair("client_reference_id", user_id);
        Ok(url.to_string())
    }
}
