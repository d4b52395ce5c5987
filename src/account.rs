//! Seller-account attribution and per-tab session state.

use crate::models::{AccountId, PageKind};
use chrono::{DateTime, Duration, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Elements in the eBay header that carry the signed-in seller's name.
const USER_INFO_SELECTORS: &[&str] = &[
    "#gh-un",
    ".gh-identity__username",
    "[data-test-id='seller-account-name']",
    "#user-info .user-id",
];

/// Account switcher / greeting elements rendering `Hi <name>`.
const SWITCHER_SELECTORS: &[&str] = &[
    "#gh-ug",
    ".gh-identity__greeting",
    "#gh-eb-u",
    "button.gh-account-switcher",
];

/// A page DOM as seen by the page-side agent at one moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    #[serde(default)]
    pub tab_id: Option<i64>,
    pub url: String,
    #[serde(default)]
    pub html: String,
}

impl PageSnapshot {
    pub fn new(tab_id: Option<i64>, url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            tab_id,
            url: url.into(),
            html: html.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    UserInfo,
    Switcher,
    Url,
    Cache,
}

/// Resolution order: header user-info element, `Hi <name>` switcher text,
/// `seller=<id>` on seller hosts, the tab's cached identity. Every step is
/// best-effort; a missing or malformed DOM yields `None`, never an error.
pub fn resolve(
    page: &PageSnapshot,
    cache: Option<&AccountCache>,
    now: DateTime<Utc>,
) -> Option<(AccountId, ResolvedFrom)> {
    if !page.html.is_empty() {
        let document = Html::parse_document(&page.html);
        if let Some(account) = first_text(&document, USER_INFO_SELECTORS).and_then(AccountId::new) {
            return Some((account, ResolvedFrom::UserInfo));
        }
        if let Some(account) = SWITCHER_SELECTORS
            .iter()
            .filter_map(|selector| select_texts(&document, selector))
            .flatten()
            .find_map(|text| parse_greeting(&text))
        {
            return Some((account, ResolvedFrom::Switcher));
        }
    }

    if let Some(account) = seller_from_url(&page.url) {
        return Some((account, ResolvedFrom::Url));
    }

    let cached = page
        .tab_id
        .zip(cache)
        .and_then(|(tab_id, cache)| cache.get(tab_id, now).cloned());
    if let Some(account) = cached {
        return Some((account, ResolvedFrom::Cache));
    }

    debug!(target = "ingest.capture", url = %page.url, "account_unresolved");
    None
}

fn select_texts(document: &Html, selector: &str) -> Option<Vec<String>> {
    let parsed = Selector::parse(selector).ok()?;
    Some(
        document
            .select(&parsed)
            .map(|element| element.text().collect::<Vec<_>>().join(" "))
            .collect(),
    )
}

fn first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|selector| select_texts(document, selector))
        .flatten()
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|text| !text.is_empty())
}

/// Extracts `<name>` from greetings like `Hi seller123!` or `Hi, Jane (42)`.
pub fn parse_greeting(text: &str) -> Option<AccountId> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let start = normalized.find("Hi ").or_else(|| normalized.find("Hi,"))?;
    let rest = normalized[start + 3..].trim_start_matches([',', ' ']);
    let name = rest
        .split(['!', ',', '(', '<'])
        .next()
        .unwrap_or_default()
        .trim();
    AccountId::new(name)
}

/// `seller=<id>` on `seller.ebay.*`-like hosts.
pub fn seller_from_url(raw: &str) -> Option<AccountId> {
    let parsed = reqwest::Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let is_seller_host = labels.first().is_some_and(|label| label.starts_with("seller"))
        && labels.contains(&"ebay");
    if !is_seller_host {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "seller")
        .and_then(|(_, value)| AccountId::new(value))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedAccount {
    pub account: AccountId,
    pub resolved_at: DateTime<Utc>,
}

/// Latest identity per tab, expiring after the TTL.
#[derive(Debug, Clone)]
pub struct AccountCache {
    ttl: Duration,
    by_tab: HashMap<i64, CachedAccount>,
}

impl AccountCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_tab: HashMap::new(),
        }
    }

    pub fn get(&self, tab_id: i64, now: DateTime<Utc>) -> Option<&AccountId> {
        self.by_tab
            .get(&tab_id)
            .filter(|entry| now - entry.resolved_at <= self.ttl)
            .map(|entry| &entry.account)
    }

    pub fn put(&mut self, tab_id: i64, account: AccountId, now: DateTime<Utc>) {
        self.by_tab.insert(
            tab_id,
            CachedAccount {
                account,
                resolved_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, tab_id: i64) -> Option<AccountId> {
        self.by_tab.remove(&tab_id).map(|entry| entry.account)
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.by_tab.len();
        let ttl = self.ttl;
        self.by_tab.retain(|_, entry| now - entry.resolved_at <= ttl);
        before - self.by_tab.len()
    }

    /// Persisted as `account.by_tab`, keyed by the tab id as a string.
    pub fn to_persisted(&self) -> HashMap<String, CachedAccount> {
        self.by_tab
            .iter()
            .map(|(tab, entry)| (tab.to_string(), entry.clone()))
            .collect()
    }

    pub fn load_persisted(&mut self, entries: HashMap<String, CachedAccount>) {
        for (tab, entry) in entries {
            if let Ok(tab_id) = tab.parse::<i64>() {
                self.by_tab.insert(tab_id, entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_tab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tab.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ButtonStatus {
    #[default]
    Unknown,
    Missing,
    Found {
        label: String,
    },
}

/// Soft per-tab state; rebuilt from page reports at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSession {
    pub tab_id: i64,
    pub account: Option<AccountId>,
    pub last_capture_at: Option<DateTime<Utc>>,
    pub page_kind: PageKind,
    pub download_button: ButtonStatus,
    pub updated_at: DateTime<Utc>,
}

impl AccountSession {
    pub fn new(tab_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            tab_id,
            account: None,
            last_capture_at: None,
            page_kind: PageKind::Unknown,
            download_button: ButtonStatus::Unknown,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, html: &str) -> PageSnapshot {
        PageSnapshot::new(Some(3), url, html)
    }

    #[test]
    fn user_info_element_wins() {
        let html = r#"<html><body><div id="gh-ug">Hi other!</div><span id="gh-un"> seller123 </span></body></html>"#;
        let (account, from) = resolve(&page("https://www.ebay.com/sh/ord", html), None, Utc::now())
            .expect("resolved");
        assert_eq!(account.as_str(), "seller123");
        assert_eq!(from, ResolvedFrom::UserInfo);
    }

    #[test]
    fn greeting_in_switcher_is_parsed() {
        let html = r#"<div id="gh-ug">Hi <b>jane_doe</b>!</div>"#;
        let (account, from) = resolve(&page("https://www.ebay.com/", html), None, Utc::now())
            .expect("resolved");
        assert_eq!(account.as_str(), "jane_doe");
        assert_eq!(from, ResolvedFrom::Switcher);
        assert_eq!(parse_greeting("Hi, Bob (1234)").unwrap().as_str(), "Bob");
        assert!(parse_greeting("Sign in").is_none());
    }

    #[test]
    fn seller_query_param_on_seller_hosts_only() {
        assert_eq!(
            seller_from_url("https://seller.ebay.com/hub?seller=acme-store").unwrap().as_str(),
            "acme-store"
        );
        assert!(seller_from_url("https://www.ebay.com/?seller=acme").is_none());
        assert!(seller_from_url("not a url").is_none());
    }

    #[test]
    fn falls_back_to_cache_then_none() {
        let now = Utc::now();
        let mut cache = AccountCache::new(Duration::minutes(30));
        cache.put(3, AccountId::new("cached").unwrap(), now);
        let blank = page("https://www.ebay.com/sh/ovw", "<html></html>");
        let (account, from) = resolve(&blank, Some(&cache), now).expect("cached");
        assert_eq!(account.as_str(), "cached");
        assert_eq!(from, ResolvedFrom::Cache);

        let later = now + Duration::minutes(31);
        assert!(resolve(&blank, Some(&cache), later).is_none());
    }

    #[test]
    fn malformed_dom_is_tolerated() {
        let broken = page("::::", "<div><span class=\"gh-x\"></div></p></table><div id=\"gh-un\">   ");
        assert!(resolve(&broken, None, Utc::now()).is_none());
    }

    #[test]
    fn cache_purges_expired_and_round_trips_tab_keys() {
        let now = Utc::now();
        let mut cache = AccountCache::new(Duration::minutes(30));
        cache.put(1, AccountId::new("a").unwrap(), now - Duration::minutes(45));
        cache.put(2, AccountId::new("b").unwrap(), now);
        assert_eq!(cache.purge_expired(now), 1);

        let mut restored = AccountCache::new(Duration::minutes(30));
        restored.load_persisted(cache.to_persisted());
        assert_eq!(restored.get(2, now).map(AccountId::as_str), Some("b"));
        assert_eq!(restored.len(), 1);
    }
}
