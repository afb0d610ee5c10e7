// Static assets for the landing surface, embedded at compile time.

pub(crate) struct StaticAsset {
    pub(crate) content_type: &'static str,
    pub(crate) body: &'static [u8],
}

pub(crate) fn get(path: &str) -> Option<StaticAsset> {
    match path {
        "/" | "/index.html" => Some(StaticAsset {
            content_type: "text/html; charset=utf-8",
            body: include_bytes!("../public/index.html"),
        }),
        "/style.css" => Some(StaticAsset {
            content_type: "text/css",
            body: include_bytes!("../public/style.css"),
        }),
        _ => None,
    }
}
