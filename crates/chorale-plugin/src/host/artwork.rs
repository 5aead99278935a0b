//! Artwork service: public URL generation for library artwork.
//!
//! Pure string work; no network or database access happens here. The
//! guest gets back a URL it can embed in metadata it returns.

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};

use crate::runtime::HostLibrary;

use super::HostContext;

#[derive(Clone)]
pub struct ArtworkHost {
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ArtworkUrlRequest {
    /// "artist", "album" or "track".
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ArtworkUrlResponse {
    pub url: String,
}

pub(crate) fn artwork_url(base: &str, kind: &str, id: &str, size: Option<u32>) -> Option<String> {
    if !matches!(kind, "artist" | "album" | "track") {
        return None;
    }
    let mut url = format!("{}/artwork/{kind}/{id}", base.trim_end_matches('/'));
    if let Some(size) = size {
        url.push_str(&format!("?size={size}"));
    }
    Some(url)
}

host_fn!(artwork_get_url(user_data: ArtworkHost; req: Json<ArtworkUrlRequest>) -> Json<ArtworkUrlResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("artwork state poisoned"))?;
    let req = req.0;
    let url = artwork_url(&host.base_url, &req.kind, &req.id, req.size)
        .ok_or_else(|| extism::Error::msg(format!("unknown artwork kind: {}", req.kind)))?;
    Ok(Json(ArtworkUrlResponse { url }))
});

pub fn library(ctx: &HostContext) -> HostLibrary {
    let state = ArtworkHost {
        base_url: ctx.artwork_base_url.clone(),
    };
    HostLibrary::new("artwork", vec!["artwork_get_url".to_string()], move || {
        vec![Function::new(
            "artwork_get_url",
            [PTR],
            [PTR],
            UserData::new(state.clone()),
            artwork_get_url,
        )]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_generation() {
        assert_eq!(
            artwork_url("https://music.example.com", "album", "al-42", None).unwrap(),
            "https://music.example.com/artwork/album/al-42"
        );
        assert_eq!(
            artwork_url("https://music.example.com/", "artist", "ar-7", Some(300)).unwrap(),
            "https://music.example.com/artwork/artist/ar-7?size=300"
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(artwork_url("https://x", "playlist", "p1", None).is_none());
    }
}
