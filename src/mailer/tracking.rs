//! Open/click instrumentation for outbound HTML.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use uuid::Uuid;

static HTTP_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="(http[^"]+)""#).expect("href regex is valid"));

/// Ids that let open/click hits be tied back to a campaign-lead and step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingIds {
    pub campaign_lead_id: Uuid,
    pub sequence_id: Option<Uuid>,
}

impl TrackingIds {
    fn query(&self) -> String {
        let step = self
            .sequence_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        format!("id={}&step={}", self.campaign_lead_id, step)
    }
}

/// Append an open pixel and route every external link through the click endpoint.
///
/// Links already pointing at `/tracking/` are left alone.
pub fn instrument(html: &str, base_url: &str, ids: &TrackingIds) -> String {
    let base = base_url.trim_end_matches('/');
    let query = ids.query();

    let rewritten = HTTP_HREF.replace_all(html, |caps: &Captures| {
        let url = &caps[1];
        if url.contains("/tracking/") {
            return caps[0].to_string();
        }
        format!(
            r#"href="{base}/tracking/click?url={}&{query}""#,
            urlencoding::encode(url)
        )
    });

    format!(
        r#"{rewritten}<img src="{base}/tracking/open?{query}" alt="" width="1" height="1" style="display:none;" />"#
    )
}
