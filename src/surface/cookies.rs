use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thirtyfour::prelude::*;
use tracing::{debug, info};

/// Browser cookie as persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieData {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

/// Cookie file backing a portal login
pub struct CookieJar {
    file: PathBuf,
}

impl CookieJar {
    pub fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
        }
    }

    /// Save cookies from the current browser session
    pub async fn save(&self, driver: &WebDriver) -> Result<usize> {
        let cookies = driver.get_all_cookies().await?;

        let cookie_data: Vec<CookieData> = cookies
            .iter()
            .map(|cookie| CookieData {
                name: cookie.name().to_string(),
                value: cookie.value().to_string(),
                domain: cookie.domain().map(|s| s.to_string()),
                path: cookie.path().map(|s| s.to_string()),
                secure: cookie.secure().unwrap_or(false),
                http_only: cookie.http_only().unwrap_or(false),
            })
            .collect();

        let json = serde_json::to_string_pretty(&cookie_data)?;
        fs::write(&self.file, json)
            .with_context(|| format!("Failed to write cookie file {:?}", self.file))?;

        info!("✅ Saved {} cookies to {:?}", cookie_data.len(), self.file);
        Ok(cookie_data.len())
    }

    /// Add saved cookies to the browser. The browser must already be on the
    /// cookies' domain.
    pub async fn load(&self, driver: &WebDriver) -> Result<bool> {
        if !self.file.exists() {
            debug!("No saved cookies at {:?}", self.file);
            return Ok(false);
        }

        let json = fs::read_to_string(&self.file).context("Failed to read cookie file")?;
        let cookie_data: Vec<CookieData> =
            serde_json::from_str(&json).context("Failed to parse cookie file")?;

        if cookie_data.is_empty() {
            return Ok(false);
        }

        for data in cookie_data {
            let mut cookie = Cookie::new(data.name.clone(), data.value.clone());
            if let Some(ref domain) = data.domain {
                cookie.set_domain(domain.clone());
            }
            if let Some(ref path) = data.path {
                cookie.set_path(path.clone());
            }
            cookie.set_secure(data.secure);
            cookie.set_http_only(data.http_only);

            if let Err(e) = driver.add_cookie(cookie).await {
                debug!("Failed to add cookie {}: {}", data.name, e);
            }
        }

        info!("🍪 Restored cookies from {:?}", self.file);
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        if self.file.exists() {
            fs::remove_file(&self.file).context("Failed to delete cookie file")?;
            info!("🗑️  Cleared saved cookies");
        }
        Ok(())
    }
}
