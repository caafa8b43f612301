//! Subscription decoding and fetching
//!
//! A subscription payload is a base64 document holding one protocol URI per
//! line. Lines are decoded independently: a malformed line is logged and
//! skipped, it never aborts the batch.

use crate::error::{IntoEngineError, Result};
use crate::profile::{ConnectionProfile, Subscription};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;

pub mod links;

pub use links::parse_link;

/// Decode a subscription payload into profiles stamped with `subscription_name`
///
/// Profiles keep the relative order of their lines.
pub fn parse_subscription(payload: &[u8], subscription_name: &str) -> Vec<ConnectionProfile> {
    let text = decode_payload(payload);
    let mut profiles = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_link(line) {
            Ok(mut profile) => {
                profile.subscription_name = subscription_name.to_string();
                profiles.push(profile);
            }
            Err(e) => {
                skipped += 1;
                log::warn!(
                    "Skipping line {} of subscription '{}': {}",
                    index + 1,
                    subscription_name,
                    e
                );
            }
        }
    }

    log::info!(
        "Parsed subscription '{}': {} profiles, {} skipped",
        subscription_name,
        profiles.len(),
        skipped
    );
    profiles
}

/// Fetch a subscription over HTTP and decode it
///
/// Transport failures are errors; per-line failures are absorbed by
/// [`parse_subscription`].
pub async fn fetch_subscription(
    client: &reqwest::Client,
    subscription: &Subscription,
) -> Result<Vec<ConnectionProfile>> {
    let url = url::Url::parse(&subscription.url).into_engine_error("Invalid subscription URL")?;
    log::info!("Fetching subscription '{}'", subscription.name);

    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    log::debug!("Subscription '{}' returned {} bytes", subscription.name, body.len());

    Ok(parse_subscription(&body, &subscription.name))
}

/// Base64 with either alphabet, padding optional, whitespace ignored
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = cleaned.trim_end_matches('=');
    if trimmed.is_empty() {
        return None;
    }
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()
}

fn decode_payload(payload: &[u8]) -> String {
    let raw = String::from_utf8_lossy(payload);
    // A stray non-UTF-8 byte only spoils its own line
    if let Some(bytes) = decode_base64(&raw) {
        return String::from_utf8_lossy(&bytes).into_owned();
    }
    if raw.contains("://") {
        log::debug!("Subscription payload is a plain URI list");
        return raw.into_owned();
    }
    log::warn!("Subscription payload is neither base64 nor a URI list");
    String::new()
}

/// Profiles grouped by the subscription they came from
///
/// Refreshing a subscription replaces its whole batch.
#[derive(Debug, Default)]
pub struct ProfileCatalog {
    batches: Vec<(Subscription, Vec<ConnectionProfile>)>,
}

impl ProfileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly parsed batch, returning the batch it replaced
    pub fn replace(
        &mut self,
        subscription: Subscription,
        profiles: Vec<ConnectionProfile>,
    ) -> Option<Vec<ConnectionProfile>> {
        match self.batches.iter_mut().find(|(s, _)| s.id == subscription.id) {
            Some(entry) => {
                entry.0 = subscription;
                Some(std::mem::replace(&mut entry.1, profiles))
            }
            None => {
                self.batches.push((subscription, profiles));
                None
            }
        }
    }

    /// Drop a subscription and its profiles
    pub fn remove(&mut self, subscription_id: &str) -> Option<Vec<ConnectionProfile>> {
        let index = self.batches.iter().position(|(s, _)| s.id == subscription_id)?;
        Some(self.batches.remove(index).1)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.batches.iter().map(|(s, _)| s)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ConnectionProfile> {
        self.batches.iter().flat_map(|(_, p)| p.iter())
    }

    pub fn find(&self, id: &str) -> Option<&ConnectionProfile> {
        self.profiles().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(|(_, p)| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
