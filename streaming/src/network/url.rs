use crate::buffer::ChunkId;
use uuid::Uuid;

/// Query parameter carrying the cache buster.
pub const CACHE_BUSTER_PARAM: &str = "nocache";

/// Builds the URL of one chunk at one bitrate.
pub trait UrlGenerator: Send + Sync {
    fn chunk_url(
        &self,
        stream_id: u32,
        chunk_id: ChunkId,
        bitrate: u64,
        start_time: u64,
        duration: u64,
    ) -> String;
}

/// Substitutes `{base}`, `{stream}`, `{chunk}`, `{bitrate}`, `{start_time}`
/// and `{duration}` in a URL template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateUrlGenerator {
    base_url: String,
    template: String,
}

impl TemplateUrlGenerator {
    pub fn new(base_url: &str, template: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            template: template.to_string(),
        }
    }
}

impl UrlGenerator for TemplateUrlGenerator {
    fn chunk_url(
        &self,
        stream_id: u32,
        chunk_id: ChunkId,
        bitrate: u64,
        start_time: u64,
        duration: u64,
    ) -> String {
        self.template
            .replace("{base}", &self.base_url)
            .replace("{stream}", &stream_id.to_string())
            .replace("{chunk}", &chunk_id.to_string())
            .replace("{bitrate}", &bitrate.to_string())
            .replace("{start_time}", &start_time.to_string())
            .replace("{duration}", &duration.to_string())
    }
}

/// Appends a unique query parameter so intermediate caches are bypassed.
pub fn with_cache_buster(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}={}",
        url,
        separator,
        CACHE_BUSTER_PARAM,
        Uuid::now_v7().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution() {
        let generator = TemplateUrlGenerator::new(
            "http://origin:8080/live/",
            "{base}/{stream}/{bitrate}/{chunk}.m4s?t={start_time}&d={duration}",
        );
        let url = generator.chunk_url(2, 17, 700_000, 340_000_000, 20_000_000);
        assert_eq!(
            url,
            "http://origin:8080/live/2/700000/17.m4s?t=340000000&d=20000000"
        );
    }

    #[test]
    fn cache_buster_is_unique() {
        let a = with_cache_buster("http://origin/a.m4s");
        let b = with_cache_buster("http://origin/a.m4s?x=1");
        assert!(a.starts_with("http://origin/a.m4s?nocache="));
        assert!(b.starts_with("http://origin/a.m4s?x=1&nocache="));
        assert_ne!(
            a.rsplit('=').next().unwrap(),
            b.rsplit('=').next().unwrap()
        );
    }
}
