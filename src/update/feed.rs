//! Release feed - Fetch and select installable releases

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::UpdateError;

/// Filename extensions we recognize as installable packages.
const INSTALLABLE_EXTENSIONS: &[&str] = &[".dmg"];

/// One release as the feed serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub body: String,
    pub html_url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<FeedAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedAsset {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub download_count: u64,
    #[serde(rename = "browser_download_url")]
    pub url: String,
}

/// The installable asset chosen from a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub size: u64,
    pub url: String,
}

/// A release the installer can act on. Created transiently per check; the
/// latest "available" one is cached until superseded or restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    pub notes: String,
    pub web_url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub asset: ReleaseAsset,
}

/// Pick the newest usable release from the feed body: the first non-draft
/// entry (optionally skipping prereleases) that carries an installable asset.
pub fn select_release(
    releases: Vec<FeedRelease>,
    include_prereleases: bool,
) -> Result<ReleaseInfo, UpdateError> {
    for release in releases {
        if release.draft || (release.prerelease && !include_prereleases) {
            continue;
        }
        let Some(asset) = release.assets.iter().find(|a| {
            let name = a.name.to_ascii_lowercase();
            INSTALLABLE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
        }) else {
            debug!("Release {} has no installable asset", release.tag_name);
            continue;
        };
        return Ok(ReleaseInfo {
            version: release.tag_name.trim_start_matches('v').to_string(),
            notes: release.body,
            web_url: release.html_url,
            published_at: release.published_at,
            asset: ReleaseAsset {
                name: asset.name.clone(),
                size: asset.size,
                url: asset.url.clone(),
            },
        });
    }
    Err(UpdateError::NoReleaseFound)
}

/// Fetch the feed and select the most recent installable release.
pub async fn fetch_latest(
    client: &reqwest::Client,
    feed_url: &str,
    include_prereleases: bool,
) -> Result<ReleaseInfo, UpdateError> {
    let response = client
        .get(feed_url)
        .header("Accept", "application/json")
        .header("User-Agent", concat!("multiclone/", env!("CARGO_PKG_VERSION")))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(UpdateError::InvalidResponse(format!(
            "feed returned HTTP {}",
            response.status()
        )));
    }

    let body = response.text().await?;
    let releases: Vec<FeedRelease> = serde_json::from_str(&body)?;
    select_release(releases, include_prereleases)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"[
      {
        "tag_name": "v1.4.0-beta.1",
        "body": "beta notes",
        "html_url": "https://example.com/r/1.4.0-beta.1",
        "published_at": "2024-06-01T12:00:00Z",
        "draft": false,
        "prerelease": true,
        "assets": [
          {"name": "App-1.4.0-beta.1.dmg", "size": 100, "download_count": 3,
           "browser_download_url": "https://example.com/a/beta.dmg"}
        ]
      },
      {
        "tag_name": "v1.3.0",
        "body": "draft notes",
        "html_url": "https://example.com/r/1.3.0",
        "published_at": null,
        "draft": true,
        "prerelease": false,
        "assets": [
          {"name": "App-1.3.0.dmg", "size": 100, "download_count": 0,
           "browser_download_url": "https://example.com/a/draft.dmg"}
        ]
      },
      {
        "tag_name": "v1.2.0",
        "body": "stable notes",
        "html_url": "https://example.com/r/1.2.0",
        "published_at": "2024-05-01T12:00:00Z",
        "draft": false,
        "prerelease": false,
        "assets": [
          {"name": "checksums.txt", "size": 1, "download_count": 0,
           "browser_download_url": "https://example.com/a/sums.txt"},
          {"name": "App-1.2.0.dmg", "size": 5000, "download_count": 42,
           "browser_download_url": "https://example.com/a/stable.dmg"}
        ]
      }
    ]"#;

    fn releases() -> Vec<FeedRelease> {
        serde_json::from_str(FEED).unwrap()
    }

    #[test]
    fn skips_drafts_and_prereleases_by_default() {
        let info = select_release(releases(), false).unwrap();
        assert_eq!(info.version, "1.2.0");
        assert_eq!(info.asset.name, "App-1.2.0.dmg");
        assert_eq!(info.asset.url, "https://example.com/a/stable.dmg");
    }

    #[test]
    fn prerelease_opt_in_takes_the_newer_beta() {
        let info = select_release(releases(), true).unwrap();
        assert_eq!(info.version, "1.4.0-beta.1");
    }

    #[test]
    fn release_without_installable_asset_is_skipped() {
        let mut rels = releases();
        rels.retain(|r| r.tag_name == "v1.2.0");
        rels[0].assets.retain(|a| !a.name.ends_with(".dmg"));
        let err = select_release(rels, false).unwrap_err();
        assert!(matches!(err, UpdateError::NoReleaseFound));
    }

    #[test]
    fn empty_feed_is_no_release_found() {
        assert!(matches!(
            select_release(Vec::new(), true).unwrap_err(),
            UpdateError::NoReleaseFound
        ));
    }
}
