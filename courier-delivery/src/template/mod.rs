//! Template renderer with a bounded cache of compiled templates.
//!
//! Templates are compiled on first use and kept in a shared
//! [`minijinja::Environment`]. Renders take a read lock; a cache miss takes
//! the write lock to compile and insert, evicting the oldest-inserted
//! template once `cache_capacity` is reached.
//!
//! There is no environment loader, so `{% include %}` and `{% extends %}`
//! only resolve templates that are currently cached.

mod helpers;

use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use courier_common::internal;
use minijinja::{AutoEscape, Environment};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::TemplateError;

/// Where template sources come from
#[derive(Debug, Clone, Deserialize)]
pub enum TemplateSource {
    /// A directory of `<name>.html` files
    Directory(PathBuf),
    /// Sources held in memory, keyed by name
    Inline(BTreeMap<String, String>),
}

impl Default for TemplateSource {
    fn default() -> Self {
        Self::Directory(PathBuf::from("templates"))
    }
}

impl TemplateSource {
    async fn load(&self, name: &str) -> Result<String, TemplateError> {
        match self {
            Self::Directory(root) => {
                if !is_safe_name(name) {
                    return Err(TemplateError::NotFound(name.to_string()));
                }

                tokio::fs::read_to_string(root.join(format!("{name}.html")))
                    .await
                    .map_err(|source| {
                        if source.kind() == std::io::ErrorKind::NotFound {
                            TemplateError::NotFound(name.to_string())
                        } else {
                            TemplateError::Load {
                                name: name.to_string(),
                                source,
                            }
                        }
                    })
            }
            Self::Inline(templates) => templates
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::NotFound(name.to_string())),
        }
    }

    async fn exists(&self, name: &str) -> bool {
        match self {
            Self::Directory(root) => {
                is_safe_name(name)
                    && tokio::fs::metadata(root.join(format!("{name}.html")))
                        .await
                        .is_ok_and(|metadata| metadata.is_file())
            }
            Self::Inline(templates) => templates.contains_key(name),
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub source: TemplateSource,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            source: TemplateSource::default(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

const fn default_cache_capacity() -> usize {
    64
}

struct Cache {
    env: Environment<'static>,
    /// Cached names, oldest first
    order: VecDeque<String>,
}

impl Cache {
    fn contains(&self, name: &str) -> bool {
        self.order.iter().any(|cached| cached == name)
    }
}

pub struct TemplateRenderer {
    source: TemplateSource,
    capacity: usize,
    cache: RwLock<Cache>,
    compiled: AtomicU64,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("source", &self.source)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached())
            .field("compiled", &self.compiled())
            .finish()
    }
}

impl TemplateRenderer {
    pub fn new(config: TemplateConfig) -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        helpers::register(&mut env);

        Self {
            source: config.source,
            capacity: config.cache_capacity.max(1),
            cache: RwLock::new(Cache {
                env,
                order: VecDeque::new(),
            }),
            compiled: AtomicU64::new(0),
        }
    }

    /// Renderer over an in-memory set of templates
    pub fn inline<N, S>(templates: impl IntoIterator<Item = (N, S)>) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        Self::new(TemplateConfig {
            source: TemplateSource::Inline(
                templates
                    .into_iter()
                    .map(|(name, source)| (name.into(), source.into()))
                    .collect(),
            ),
            ..TemplateConfig::default()
        })
    }

    /// Render `name` with `data`
    ///
    /// # Errors
    /// [`TemplateError::NotFound`] if the source has no such template,
    /// otherwise load, compile or render failures
    pub async fn render<S: Serialize>(&self, name: &str, data: S) -> Result<String, TemplateError> {
        {
            let cache = self.cache.read();
            if cache.contains(name) {
                return Self::render_cached(&cache, name, data);
            }
        }

        let source = self.source.load(name).await?;
        let cache = self.compile(name, source)?;
        let cache = RwLockWriteGuard::downgrade(cache);
        Self::render_cached(&cache, name, data)
    }

    /// Whether `name` is cached or can be loaded from the source
    pub async fn contains(&self, name: &str) -> bool {
        let cached = self.cache.read().contains(name);
        cached || self.source.exists(name).await
    }

    /// Compile `name` ahead of its first render
    ///
    /// # Errors
    /// As for [`TemplateRenderer::render`], minus render failures
    pub async fn precompile(&self, name: &str) -> Result<(), TemplateError> {
        if self.cache.read().contains(name) {
            return Ok(());
        }
        let source = self.source.load(name).await?;
        self.compile(name, source).map(drop)
    }

    /// Number of compilations performed since construction
    pub fn compiled(&self) -> u64 {
        self.compiled.load(Ordering::Relaxed)
    }

    /// Number of templates currently cached
    pub fn cached(&self) -> usize {
        self.cache.read().order.len()
    }

    fn render_cached<S: Serialize>(
        cache: &Cache,
        name: &str,
        data: S,
    ) -> Result<String, TemplateError> {
        let template = cache
            .env
            .get_template(name)
            .map_err(|_| TemplateError::NotFound(name.to_string()))?;

        template.render(data).map_err(|source| TemplateError::Render {
            name: name.to_string(),
            source,
        })
    }

    fn compile(
        &self,
        name: &str,
        source: String,
    ) -> Result<RwLockWriteGuard<'_, Cache>, TemplateError> {
        let mut cache = self.cache.write();

        // Another caller may have compiled it while the source was loading
        if cache.contains(name) {
            return Ok(cache);
        }

        cache
            .env
            .add_template_owned(name.to_string(), source)
            .map_err(|source| TemplateError::Compile {
                name: name.to_string(),
                source,
            })?;
        cache.order.push_back(name.to_string());
        self.compiled.fetch_add(1, Ordering::Relaxed);

        while cache.order.len() > self.capacity {
            if let Some(evicted) = cache.order.pop_front() {
                cache.env.remove_template(&evicted);
                internal!(level = DEBUG, "Evicted template {evicted} from cache");
            }
        }

        internal!(level = DEBUG, "Compiled template {name}");
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use minijinja::context;

    use super::*;

    fn renderer(capacity: usize) -> TemplateRenderer {
        TemplateRenderer::new(TemplateConfig {
            source: TemplateSource::Inline(BTreeMap::from([
                ("welcome".to_string(), "<p>Hello {{ name }}</p>".to_string()),
                ("receipt".to_string(), "Total {{ total | format_currency }}".to_string()),
                ("bye".to_string(), "Bye {{ name }}".to_string()),
                ("broken".to_string(), "{% if %}".to_string()),
            ])),
            cache_capacity: capacity,
        })
    }

    #[tokio::test]
    async fn test_cache_compiles_once() {
        let renderer = renderer(8);

        let alice = renderer.render("welcome", context! { name => "Alice" }).await.unwrap();
        let bob = renderer.render("welcome", context! { name => "Bob" }).await.unwrap();

        assert_eq!(alice, "<p>Hello Alice</p>");
        assert_eq!(bob, "<p>Hello Bob</p>");
        assert_eq!(renderer.compiled(), 1);
    }

    #[tokio::test]
    async fn test_values_are_escaped() {
        let renderer = renderer(8);
        let html = renderer
            .render("welcome", context! { name => "<b>x</b>" })
            .await
            .unwrap();
        assert_eq!(html, "<p>Hello &lt;b&gt;x&lt;/b&gt;</p>");
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        let renderer = renderer(2);

        renderer.precompile("welcome").await.unwrap();
        renderer.precompile("receipt").await.unwrap();
        renderer.precompile("bye").await.unwrap();
        assert_eq!(renderer.cached(), 2);
        assert_eq!(renderer.compiled(), 3);

        // welcome was oldest and has to be compiled again
        renderer.render("receipt", context! { total => 5 }).await.unwrap();
        assert_eq!(renderer.compiled(), 3);
        renderer.render("welcome", context! { name => "A" }).await.unwrap();
        assert_eq!(renderer.compiled(), 4);
    }

    #[tokio::test]
    async fn test_not_found() {
        let renderer = renderer(8);
        assert!(matches!(
            renderer.render("missing", context! {}).await,
            Err(TemplateError::NotFound(name)) if name == "missing"
        ));
        assert!(!renderer.contains("missing").await);
        assert!(renderer.contains("welcome").await);
    }

    #[tokio::test]
    async fn test_compile_error() {
        let renderer = renderer(8);
        assert!(matches!(
            renderer.precompile("broken").await,
            Err(TemplateError::Compile { .. })
        ));
        assert_eq!(renderer.cached(), 0);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Filesystem access")]
    async fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reset.html"), "Reset for {{ user }}").unwrap();

        let renderer = TemplateRenderer::new(TemplateConfig {
            source: TemplateSource::Directory(dir.path().to_path_buf()),
            cache_capacity: 4,
        });

        assert!(renderer.contains("reset").await);
        assert!(!renderer.contains("../reset").await);
        assert_eq!(
            renderer.render("reset", context! { user => "sam" }).await.unwrap(),
            "Reset for sam"
        );
        assert!(matches!(
            renderer.render("other", context! {}).await,
            Err(TemplateError::NotFound(_))
        ));
    }
}
