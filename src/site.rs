use std::sync::Arc;

use parking_lot::RwLock;

/// Snapshot of what the hosting surface currently shows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiteInfo {
    pub webview_id: String,
    pub url: String,
    pub title: String,
    pub icon: String,
}

/// Shared, mutable site info of one surface.
///
/// The lifecycle hook writes it on navigation; the bridge and its middleware
/// read it live, so same-origin navigation is visible without a rebuild.
#[derive(Clone, Debug, Default)]
pub struct SiteRefs {
    inner: Arc<RwLock<SiteInfo>>,
}

impl SiteRefs {
    pub fn new(webview_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SiteInfo {
                webview_id: webview_id.into(),
                ..SiteInfo::default()
            })),
        }
    }

    pub fn snapshot(&self) -> SiteInfo {
        self.inner.read().clone()
    }

    pub fn webview_id(&self) -> String {
        self.inner.read().webview_id.clone()
    }

    pub fn url(&self) -> String {
        self.inner.read().url.clone()
    }

    pub fn title(&self) -> String {
        self.inner.read().title.clone()
    }

    pub fn icon(&self) -> String {
        self.inner.read().icon.clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.inner.write().url = url.into();
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.inner.write().title = title.into();
    }

    pub fn set_icon(&self, icon: impl Into<String>) {
        self.inner.write().icon = icon.into();
    }
}
