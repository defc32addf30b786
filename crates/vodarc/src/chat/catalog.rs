use std::future::Future;

use serde::Deserialize;

use crate::error::Result;

/// Per-quality image URLs with downward fallback: a missing 4x falls back to
/// 3x, then 2x, then 1x.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageUrls {
    #[serde(default, rename = "url1x")]
    pub url_1x: Option<String>,
    #[serde(default, rename = "url2x")]
    pub url_2x: Option<String>,
    #[serde(default, rename = "url3x")]
    pub url_3x: Option<String>,
    #[serde(default, rename = "url4x")]
    pub url_4x: Option<String>,
}

impl ImageUrls {
    pub fn url_for(&self, quality: u8) -> Option<&str> {
        let q1 = self.url_1x.as_deref();
        let q2 = self.url_2x.as_deref();
        let q3 = self.url_3x.as_deref();
        let q4 = self.url_4x.as_deref();
        match quality {
            4 => q4.or(q3).or(q2).or(q1),
            3 => q3.or(q2).or(q1),
            2 => q2.or(q1),
            _ => q1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchBadge {
    #[serde(rename = "setId")]
    pub set_id: String,
    pub version: String,
    #[serde(flatten)]
    pub urls: ImageUrls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheerEmote {
    pub name: String,
    #[serde(rename = "minBits")]
    pub min_bits: u32,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(flatten)]
    pub urls: ImageUrls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThirdPartyEmote {
    pub name: String,
    #[serde(default, rename = "zeroWidth")]
    pub is_zero_width: bool,
    #[serde(flatten)]
    pub urls: ImageUrls,
}

/// Platform emote referenced by id; image URLs come from the catalog's
/// configured template.
#[derive(Debug, Clone)]
pub struct TwitchEmote {
    pub id: String,
    pub urls: ImageUrls,
}

/// Badge catalog collaborator.
pub trait BadgeSource: Send + Sync + 'static {
    fn channel_badges(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Vec<TwitchBadge>>> + Send;
    fn global_badges(&self) -> impl Future<Output = Result<Vec<TwitchBadge>>> + Send;
}

/// Cheer-emote catalog collaborator.
pub trait CheerSource: Send + Sync + 'static {
    fn cheer_emotes(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Vec<CheerEmote>>> + Send;
}

/// One third-party emote service. Providers form an ordered strategy list:
/// each is tried in sequence and an individual failure is logged and skipped,
/// never fatal to the download.
pub trait EmoteProviderSource: Send + Sync + 'static {
    fn provider_name(&self) -> &str;
    fn channel_emotes(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Vec<ThirdPartyEmote>>> + Send;
    fn global_emotes(&self) -> impl Future<Output = Result<Vec<ThirdPartyEmote>>> + Send;
}

/// Resolved once per download job; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    pub badges: Vec<TwitchBadge>,
    pub cheer_emotes: Vec<CheerEmote>,
    pub emotes: Vec<ThirdPartyEmote>,
    /// Template with `{id}` and `{scale}` placeholders for platform emotes.
    pub emote_url_template: Option<String>,
}

impl AssetCatalog {
    /// Gather badges, cheer emotes and third-party emotes. Channel badges
    /// shadow global badges with the same set id.
    pub async fn load<B, C, E>(
        badge_source: &B,
        cheer_source: &C,
        providers: &[E],
        channel_id: Option<&str>,
    ) -> Self
    where
        B: BadgeSource,
        C: CheerSource,
        E: EmoteProviderSource,
    {
        let mut badges = Vec::new();
        if let Some(channel_id) = channel_id {
            match badge_source.channel_badges(channel_id).await {
                Ok(list) => badges.extend(list),
                Err(e) => log::warn!("channel badges unavailable: {}", e),
            }
        }
        match badge_source.global_badges().await {
            Ok(list) => {
                for badge in list {
                    if !badges.iter().any(|b: &TwitchBadge| b.set_id == badge.set_id) {
                        badges.push(badge);
                    }
                }
            }
            Err(e) => log::warn!("global badges unavailable: {}", e),
        }

        let mut cheer_emotes = Vec::new();
        if let Some(channel_id) = channel_id {
            match cheer_source.cheer_emotes(channel_id).await {
                Ok(list) => cheer_emotes.extend(list),
                Err(e) => log::warn!("cheer emotes unavailable: {}", e),
            }
        }

        let mut emotes = Vec::new();
        for provider in providers {
            if let Some(channel_id) = channel_id {
                match provider.channel_emotes(channel_id).await {
                    Ok(list) => emotes.extend(list),
                    Err(e) => log::warn!(
                        "{} channel emotes unavailable: {}",
                        provider.provider_name(),
                        e
                    ),
                }
            }
        }
        for provider in providers {
            match provider.global_emotes().await {
                Ok(list) => emotes.extend(list),
                Err(e) => log::warn!(
                    "{} global emotes unavailable: {}",
                    provider.provider_name(),
                    e
                ),
            }
        }

        Self {
            badges,
            cheer_emotes,
            emotes,
            emote_url_template: None,
        }
    }

    pub fn with_emote_url_template(mut self, template: impl Into<String>) -> Self {
        self.emote_url_template = Some(template.into());
        self
    }

    pub fn find_badge(&self, set_id: &str, version: &str) -> Option<&TwitchBadge> {
        self.badges
            .iter()
            .find(|b| b.set_id == set_id && b.version == version)
    }

    pub fn find_emote(&self, name: &str) -> Option<&ThirdPartyEmote> {
        self.emotes.iter().find(|e| e.name == name)
    }

    /// Cheer match: the longest digit suffix is the bits count, the prefix is
    /// matched case-insensitively against catalog names with a sufficient
    /// minimum. The last qualifying tier wins.
    pub fn match_cheer(&self, word: &str) -> Option<&CheerEmote> {
        let digits: String = word
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if digits.is_empty() {
            return None;
        }
        let bits: u32 = digits.parse().ok()?;
        let name = &word[..word.len() - digits.len()];
        self.cheer_emotes
            .iter()
            .rev()
            .find(|c| c.name.eq_ignore_ascii_case(name) && c.min_bits <= bits)
    }

    pub fn twitch_emote(&self, id: &str) -> TwitchEmote {
        let urls = match &self.emote_url_template {
            Some(template) => {
                let at = |scale: &str| {
                    Some(
                        template
                            .replace("{id}", id)
                            .replace("{scale}", scale),
                    )
                };
                ImageUrls {
                    url_1x: at("1"),
                    url_2x: at("2"),
                    url_3x: at("3"),
                    url_4x: at("4"),
                }
            }
            None => ImageUrls::default(),
        };
        TwitchEmote {
            id: id.to_owned(),
            urls,
        }
    }
}

/// REST-backed catalog client. Endpoint templates take `{channel_id}`.
#[derive(Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    channel_badges_url: Option<String>,
    global_badges_url: Option<String>,
    cheer_emotes_url: Option<String>,
}

impl HttpCatalogSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            channel_badges_url: None,
            global_badges_url: None,
            cheer_emotes_url: None,
        }
    }

    pub fn with_badge_urls(
        mut self,
        channel: impl Into<String>,
        global: impl Into<String>,
    ) -> Self {
        self.channel_badges_url = Some(channel.into());
        self.global_badges_url = Some(global.into());
        self
    }

    pub fn with_cheer_url(mut self, url: impl Into<String>) -> Self {
        self.cheer_emotes_url = Some(url.into());
        self
    }

    async fn get_list<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(crate::error::Error::HttpStatus(
                resp.status().as_u16(),
                url.to_owned(),
            ));
        }
        Ok(resp.json().await?)
    }
}

impl BadgeSource for HttpCatalogSource {
    async fn channel_badges(&self, channel_id: &str) -> Result<Vec<TwitchBadge>> {
        match &self.channel_badges_url {
            Some(template) => {
                self.get_list(&template.replace("{channel_id}", channel_id))
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    async fn global_badges(&self) -> Result<Vec<TwitchBadge>> {
        match &self.global_badges_url {
            Some(url) => self.get_list(url).await,
            None => Ok(Vec::new()),
        }
    }
}

impl CheerSource for HttpCatalogSource {
    async fn cheer_emotes(&self, channel_id: &str) -> Result<Vec<CheerEmote>> {
        match &self.cheer_emotes_url {
            Some(template) => {
                self.get_list(&template.replace("{channel_id}", channel_id))
                    .await
            }
            None => Ok(Vec::new()),
        }
    }
}

/// One configured third-party emote endpoint pair.
#[derive(Clone)]
pub struct HttpEmoteProvider {
    client: reqwest::Client,
    name: String,
    channel_url: Option<String>,
    global_url: Option<String>,
}

impl HttpEmoteProvider {
    pub fn new(
        client: reqwest::Client,
        name: impl Into<String>,
        channel_url: Option<String>,
        global_url: Option<String>,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            channel_url,
            global_url,
        }
    }

    async fn get_list(&self, url: &str) -> Result<Vec<ThirdPartyEmote>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(crate::error::Error::HttpStatus(
                resp.status().as_u16(),
                url.to_owned(),
            ));
        }
        Ok(resp.json().await?)
    }
}

impl EmoteProviderSource for HttpEmoteProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn channel_emotes(&self, channel_id: &str) -> Result<Vec<ThirdPartyEmote>> {
        match &self.channel_url {
            Some(template) => self.get_list(&template.replace("{channel_id}", channel_id)).await,
            None => Ok(Vec::new()),
        }
    }

    async fn global_emotes(&self) -> Result<Vec<ThirdPartyEmote>> {
        match &self.global_url {
            Some(url) => self.get_list(url).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn urls(one: &str) -> ImageUrls {
        ImageUrls {
            url_1x: Some(one.to_owned()),
            ..Default::default()
        }
    }

    struct StubBadges {
        fail_global: bool,
    }

    impl BadgeSource for StubBadges {
        async fn channel_badges(&self, _channel_id: &str) -> Result<Vec<TwitchBadge>> {
            Ok(vec![TwitchBadge {
                set_id: "subscriber".into(),
                version: "0".into(),
                urls: urls("channel-sub"),
            }])
        }

        async fn global_badges(&self) -> Result<Vec<TwitchBadge>> {
            if self.fail_global {
                return Err(Error::HttpStatus(503, "badges".into()));
            }
            Ok(vec![
                TwitchBadge {
                    set_id: "subscriber".into(),
                    version: "0".into(),
                    urls: urls("global-sub"),
                },
                TwitchBadge {
                    set_id: "moderator".into(),
                    version: "1".into(),
                    urls: urls("global-mod"),
                },
            ])
        }
    }

    struct StubCheers;

    impl CheerSource for StubCheers {
        async fn cheer_emotes(&self, _channel_id: &str) -> Result<Vec<CheerEmote>> {
            Ok(vec![
                CheerEmote {
                    name: "Cheer".into(),
                    min_bits: 1,
                    color: None,
                    urls: urls("cheer1"),
                },
                CheerEmote {
                    name: "Cheer".into(),
                    min_bits: 100,
                    color: Some("#9c3ee8".into()),
                    urls: urls("cheer100"),
                },
            ])
        }
    }

    struct StubProvider {
        name: &'static str,
        fail: bool,
    }

    impl EmoteProviderSource for StubProvider {
        fn provider_name(&self) -> &str {
            self.name
        }

        async fn channel_emotes(&self, _channel_id: &str) -> Result<Vec<ThirdPartyEmote>> {
            if self.fail {
                return Err(Error::HttpStatus(500, self.name.into()));
            }
            Ok(vec![ThirdPartyEmote {
                name: format!("{}Emote", self.name),
                is_zero_width: false,
                urls: urls(self.name),
            }])
        }

        async fn global_emotes(&self) -> Result<Vec<ThirdPartyEmote>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn channel_badges_shadow_global_sets() {
        let catalog = AssetCatalog::load(
            &StubBadges { fail_global: false },
            &StubCheers,
            &[] as &[StubProvider],
            Some("c1"),
        )
        .await;
        let sub = catalog.find_badge("subscriber", "0").unwrap();
        assert_eq!(sub.urls.url_1x.as_deref(), Some("channel-sub"));
        assert!(catalog.find_badge("moderator", "1").is_some());
    }

    #[tokio::test]
    async fn failing_provider_is_skipped_not_fatal() {
        let providers = [
            StubProvider {
                name: "first",
                fail: true,
            },
            StubProvider {
                name: "second",
                fail: false,
            },
        ];
        let catalog = AssetCatalog::load(
            &StubBadges { fail_global: true },
            &StubCheers,
            &providers,
            Some("c1"),
        )
        .await;
        assert!(catalog.find_emote("secondEmote").is_some());
        assert!(catalog.find_emote("firstEmote").is_none());
    }

    #[tokio::test]
    async fn cheer_matching_picks_highest_qualifying_tier() {
        let catalog = AssetCatalog::load(
            &StubBadges { fail_global: false },
            &StubCheers,
            &[] as &[StubProvider],
            Some("c1"),
        )
        .await;
        let low = catalog.match_cheer("cheer10").unwrap();
        assert_eq!(low.min_bits, 1);
        let high = catalog.match_cheer("Cheer500").unwrap();
        assert_eq!(high.min_bits, 100);
        assert!(catalog.match_cheer("Cheer").is_none());
        assert!(catalog.match_cheer("hello").is_none());
    }

    #[test]
    fn quality_fallback_walks_down() {
        let urls = ImageUrls {
            url_1x: Some("1".into()),
            url_2x: Some("2".into()),
            url_3x: None,
            url_4x: None,
        };
        assert_eq!(urls.url_for(4), Some("2"));
        assert_eq!(urls.url_for(3), Some("2"));
        assert_eq!(urls.url_for(1), Some("1"));
    }

    #[test]
    fn emote_url_template_expands() {
        let catalog = AssetCatalog::default()
            .with_emote_url_template("https://cdn/emote/{id}/{scale}");
        let emote = catalog.twitch_emote("25");
        assert_eq!(
            emote.urls.url_4x.as_deref(),
            Some("https://cdn/emote/25/4")
        );
    }
}
