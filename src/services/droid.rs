use std::{
    env,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use fake_user_agent::get_chrome_rua;
use thirtyfour::{
    error::WebDriverResult, extensions::cdp::ChromeDevTools, By, ChromeCapabilities,
    ChromiumLikeCapabilities, DesiredCapabilities, WebDriver,
};
use url::Url;

use crate::configuration::Settings;

const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TABLE_SETTLE_PAUSE: Duration = Duration::from_secs(3);
const LAZY_CONTENT_PAUSE: Duration = Duration::from_secs(1);
const STARTUP_PROBES: u8 = 20;
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const FALLBACK_WEBDRIVER_PORT: u16 = 9515;

const WEBDRIVER_MASK_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";

/*
 Next-control matchers, tried in order. First element that is both
 visible and enabled wins.
 1. rel="next" anchors
 2. anchors whose text contains "next" in any casing
 3. buttons whose text contains "next" in any casing
 4. anchors with a "next" class
 5. anchors, then buttons, with a "Next" aria-label
*/
const NEXT_CONTROL_XPATHS: [&str; 6] = [
    "//a[@rel='next']",
    "//a[contains(translate(normalize-space(.),'ABCDEFGHIJKLMNOPQRSTUVWXYZ','abcdefghijklmnopqrstuvwxyz'),'next')]",
    "//button[contains(translate(normalize-space(.),'ABCDEFGHIJKLMNOPQRSTUVWXYZ','abcdefghijklmnopqrstuvwxyz'),'next')]",
    "//a[contains(@class,'next')]",
    "//a[contains(@aria-label,'Next')]",
    "//button[contains(@aria-label,'Next')]",
];

/// Browser surface the pagination loop drives. `Droid` is the real
/// implementation; tests substitute a scripted one.
#[async_trait]
pub trait PageDriver {
    async fn open(&self, url: &str) -> anyhow::Result<()>;

    /// Returns whether a table actually appeared before the timeout.
    async fn await_table(&self, timeout: Duration) -> bool;

    async fn page_source(&self) -> anyhow::Result<String>;

    /// Activates a "next" control if one is found. Reports activation,
    /// not navigation: whether the page really changed is not checked.
    async fn advance(&self) -> anyhow::Result<bool>;
}

pub struct Droid {
    pub driver: WebDriver,
    chromedriver: Option<Child>,
}

impl Droid {
    /// Brings up a browser session, trying in order: an already-running
    /// WebDriver server, the configured chromedriver binary, a
    /// chromedriver found on PATH. Fatal only when all three fail.
    pub async fn acquire(settings: &Settings) -> anyhow::Result<Droid> {
        match Self::connect(settings).await {
            Ok(driver) => {
                return Ok(Droid {
                    driver,
                    chromedriver: None,
                })
            }
            Err(e) => log::warn!(
                "No WebDriver server at {}, starting chromedriver instead: {}",
                settings.webdriver_url,
                e
            ),
        }

        let port = webdriver_port(&settings.webdriver_url);

        if let Some(path) = &settings.chromedriver_path {
            log::info!("Using chromedriver from CHROMEDRIVER_PATH: {}", path);
            match Self::boot_and_connect(Path::new(path), port, settings).await {
                Ok(droid) => return Ok(droid),
                Err(e) => log::warn!("chromedriver at {} did not come up: {:?}", path, e),
            }
        }

        match locate_chromedriver() {
            Some(binary) => {
                log::info!("Falling back to chromedriver at {}", binary.display());
                Self::boot_and_connect(&binary, port, settings).await
            }
            None => Err(anyhow::anyhow!(
                "no WebDriver server reachable at {} and no chromedriver binary available",
                settings.webdriver_url
            )),
        }
    }

    async fn connect(settings: &Settings) -> WebDriverResult<WebDriver> {
        let caps = build_capabilities(settings)?;
        let driver = WebDriver::new(&settings.webdriver_url, caps).await?;

        // Best effort: sites probe navigator.webdriver before rendering.
        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        if let Err(e) = dev_tools
            .execute_cdp_with_params(
                "Page.addScriptToEvaluateOnNewDocument",
                serde_json::json!({ "source": WEBDRIVER_MASK_SCRIPT }),
            )
            .await
        {
            log::warn!("Could not mask navigator.webdriver: {}", e);
        }

        Ok(driver)
    }

    async fn boot_and_connect(
        binary: &Path,
        port: u16,
        settings: &Settings,
    ) -> anyhow::Result<Droid> {
        let mut child = Command::new(binary)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if !await_driver_ready(&settings.webdriver_url).await {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("chromedriver at {} never reported ready", binary.display());
        }

        match Self::connect(settings).await {
            Ok(driver) => Ok(Droid {
                driver,
                chromedriver: Some(child),
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e.into())
            }
        }
    }

    /// Ends the session and reaps a spawned chromedriver. Called on
    /// success and failure paths alike, so failures only get logged.
    pub async fn release(self) {
        let Droid {
            driver,
            chromedriver,
        } = self;

        if let Err(e) = driver.quit().await {
            log::warn!("Browser session did not shut down cleanly: {}", e);
        }

        if let Some(mut child) = chromedriver {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[async_trait]
impl PageDriver for Droid {
    async fn open(&self, url: &str) -> anyhow::Result<()> {
        self.driver.goto(url).await?;
        Ok(())
    }

    async fn await_table(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if self.driver.find(By::Tag("table")).await.is_ok() {
                return true;
            }
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }

        log::warn!(
            "No table appeared within {:?}, settling for {:?} and parsing anyway",
            timeout,
            TABLE_SETTLE_PAUSE
        );
        tokio::time::sleep(TABLE_SETTLE_PAUSE).await;
        false
    }

    async fn page_source(&self) -> anyhow::Result<String> {
        // Scroll to the bottom first so lazy-loaded rows get rendered.
        if let Err(e) = self
            .driver
            .execute("window.scrollTo(0, document.body.scrollHeight);", vec![])
            .await
        {
            log::debug!("Could not scroll to the page bottom: {}", e);
        }
        tokio::time::sleep(LAZY_CONTENT_PAUSE).await;

        Ok(self.driver.source().await?)
    }

    async fn advance(&self) -> anyhow::Result<bool> {
        for xpath in NEXT_CONTROL_XPATHS {
            let elements = match self.driver.find_all(By::XPath(xpath)).await {
                Ok(elements) => elements,
                Err(_) => continue,
            };

            for element in elements {
                let visible = element.is_displayed().await.unwrap_or(false);
                let enabled = element.is_enabled().await.unwrap_or(false);
                if !(visible && enabled) {
                    continue;
                }

                match element.click().await {
                    Ok(()) => return Ok(true),
                    Err(e) => {
                        log::debug!("Next control matched by {} refused the click: {}", xpath, e)
                    }
                }
            }
        }

        Ok(false)
    }
}

fn build_capabilities(settings: &Settings) -> WebDriverResult<ChromeCapabilities> {
    let mut caps = DesiredCapabilities::chrome();

    match settings.headless {
        true => {
            caps.add_arg("--headless=new")?;
            caps.add_arg("--disable-gpu")?;
        }
        false => caps.add_arg("--window-size=1600,1200")?,
    }

    caps.add_arg("--no-sandbox")?;
    caps.add_arg("--disable-dev-shm-usage")?;
    caps.add_arg("--disable-blink-features=AutomationControlled")?;
    caps.add_experimental_option("excludeSwitches", ["enable-automation"])?;
    caps.add_experimental_option("useAutomationExtension", false)?;

    let user_agent = match &settings.user_agent {
        Some(user_agent) => user_agent.clone(),
        None => get_chrome_rua().to_string(),
    };
    caps.add_arg(&format!("--user-agent={}", user_agent))?;
    caps.add_arg("--lang=en-US")?;

    Ok(caps)
}

async fn await_driver_ready(webdriver_url: &str) -> bool {
    let status_url = format!("{}/status", webdriver_url.trim_end_matches('/'));

    for _ in 0..STARTUP_PROBES {
        if let Ok(response) = reqwest::get(&status_url).await {
            if let Ok(body) = response.json::<serde_json::Value>().await {
                if body["value"]["ready"].as_bool().unwrap_or(false) {
                    return true;
                }
            }
        }
        tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
    }

    false
}

fn webdriver_port(webdriver_url: &str) -> u16 {
    Url::parse(webdriver_url)
        .ok()
        .and_then(|url| url.port())
        .unwrap_or(FALLBACK_WEBDRIVER_PORT)
}

fn locate_chromedriver() -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join("chromedriver"))
        .find(|candidate| candidate.is_file())
}
