use std::{fs, path::Path, time::Duration};

use crate::{
    configuration::Settings,
    domain::record::ResultSet,
    services::{extract_fee_rows, Droid, PageDriver},
};

const TABLE_WAIT: Duration = Duration::from_secs(20);
const ADVANCE_PAUSE: Duration = Duration::from_millis(1500);

/// Scrapes the configured pricing page end to end: acquire a browser,
/// paginate, release the browser, write out whatever was collected.
/// Pagination errors degrade to partial output instead of losing it.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let droid = Droid::acquire(&settings).await?;

    let mut results = ResultSet::new();
    let mut pages_visited = 0;

    let outcome = paginate(&droid, &settings, &mut results, &mut pages_visited).await;
    droid.release().await;

    if let Err(e) = outcome {
        log::error!("Error during pagination: {:?}", e);
    }

    persist(&results, &settings.output_file)?;

    log::info!("Scraped {} rows from {} pages", results.len(), pages_visited);
    log::info!("Output saved to {}", settings.output_file.display());

    Ok(())
}

/*
 One pass per page:
 1. Wait for the table (lenient: a timeout degrades to a settle pause)
 2. Capture the rendered source, snapshot it if enabled
 3. Extract rows and insert them through the dedup set
 4. Activate the next control; stop when none is found or the page
    ceiling is reached
*/
pub async fn paginate<D: PageDriver>(
    driver: &D,
    settings: &Settings,
    results: &mut ResultSet,
    pages_visited: &mut u32,
) -> anyhow::Result<()> {
    driver.open(&settings.target_url).await?;

    let mut page_num = 1;
    loop {
        driver.await_table(TABLE_WAIT).await;

        let page_source = driver.page_source().await?;
        if settings.save_page_snapshots {
            save_snapshot(&settings.snapshot_dir, page_num, &page_source);
        }

        let page_rows = extract_fee_rows(&page_source);
        let row_count = page_rows.len();
        let mut added = 0;
        for record in page_rows {
            if results.insert(record) {
                added += 1;
            }
        }

        *pages_visited = page_num;
        log::info!("Page {}: found {} rows, {} new", page_num, row_count, added);

        let advanced = driver.advance().await?;
        if !advanced || page_num >= settings.max_pages {
            break;
        }

        page_num += 1;
        tokio::time::sleep(ADVANCE_PAUSE).await;
    }

    Ok(())
}

pub fn persist(results: &ResultSet, output_file: &Path) -> anyhow::Result<()> {
    let json = results.to_json_pretty()?;
    fs::write(output_file, json)?;
    Ok(())
}

// Best effort, one file per visited page.
fn save_snapshot(dir: &Path, page_num: u32, page_source: &str) {
    let path = dir.join(format!("page_{}.html", page_num));
    if let Err(e) = fs::write(&path, page_source) {
        log::warn!("Could not save snapshot {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    const PRICING_TABLE: &str =
        "<table><tr><th>Visa</th><th>Fee</th></tr><tr><td>Visitor</td><td>$145</td></tr></table>";

    struct FakeDriver {
        page_source: String,
        has_next: bool,
        advance_calls: AtomicU32,
        source_calls: AtomicU32,
        fail_from_page: Option<u32>,
    }

    impl FakeDriver {
        fn new(page_source: &str, has_next: bool) -> Self {
            Self {
                page_source: page_source.to_string(),
                has_next,
                advance_calls: AtomicU32::new(0),
                source_calls: AtomicU32::new(0),
                fail_from_page: None,
            }
        }
    }

    #[async_trait]
    impl PageDriver for FakeDriver {
        async fn open(&self, _url: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn await_table(&self, _timeout: Duration) -> bool {
            true
        }

        async fn page_source(&self) -> anyhow::Result<String> {
            let call = self.source_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(fail_from) = self.fail_from_page {
                if call >= fail_from {
                    anyhow::bail!("browser went away on page {}", call);
                }
            }
            Ok(self.page_source.clone())
        }

        async fn advance(&self) -> anyhow::Result<bool> {
            self.advance_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.has_next)
        }
    }

    fn test_settings(max_pages: u32) -> Settings {
        Settings {
            target_url: "http://fixture.test/pricing".to_string(),
            output_file: "visa_fees.json".into(),
            max_pages,
            headless: true,
            user_agent: None,
            webdriver_url: "http://localhost:9515".to_string(),
            chromedriver_path: None,
            save_page_snapshots: false,
            snapshot_dir: ".".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_page_without_next_control_halts_after_one_page() {
        let driver = FakeDriver::new(PRICING_TABLE, false);
        let settings = test_settings(20);
        let mut results = ResultSet::new();
        let mut pages_visited = 0;

        paginate(&driver, &settings, &mut results, &mut pages_visited)
            .await
            .unwrap();

        assert_eq!(pages_visited, 1);
        assert_eq!(
            results.to_json_pretty().unwrap(),
            "[\n    {\n        \"Visa\": \"Visitor\",\n        \"Fee\": \"$145\"\n    }\n]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn an_always_present_next_control_stops_at_the_page_ceiling() {
        let driver = FakeDriver::new(PRICING_TABLE, true);
        let settings = test_settings(20);
        let mut results = ResultSet::new();
        let mut pages_visited = 0;

        paginate(&driver, &settings, &mut results, &mut pages_visited)
            .await
            .unwrap();

        assert_eq!(pages_visited, 20);
        assert_eq!(driver.advance_calls.load(Ordering::SeqCst), 20);
        // The same rows show up on every page; dedup keeps one copy.
        assert_eq!(results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_page_keeps_earlier_results() {
        let mut driver = FakeDriver::new(PRICING_TABLE, true);
        driver.fail_from_page = Some(2);
        let settings = test_settings(20);
        let mut results = ResultSet::new();
        let mut pages_visited = 0;

        let outcome = paginate(&driver, &settings, &mut results, &mut pages_visited).await;

        assert!(outcome.is_err());
        assert_eq!(pages_visited, 1);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_written_per_visited_page() {
        let driver = FakeDriver::new(PRICING_TABLE, false);
        let snapshot_dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(20);
        settings.save_page_snapshots = true;
        settings.snapshot_dir = snapshot_dir.path().to_path_buf();
        let mut results = ResultSet::new();
        let mut pages_visited = 0;

        paginate(&driver, &settings, &mut results, &mut pages_visited)
            .await
            .unwrap();

        let snapshot = fs::read_to_string(snapshot_dir.path().join("page_1.html")).unwrap();
        assert_eq!(snapshot, PRICING_TABLE);
    }

    #[test]
    fn persist_writes_the_indented_array() {
        let output_dir = tempfile::tempdir().unwrap();
        let output_file = output_dir.path().join("visa_fees.json");

        let mut results = ResultSet::new();
        results.insert(
            [
                ("Visa".to_string(), serde_json::json!("Visitor")),
                ("Fee".to_string(), serde_json::json!("$145")),
            ]
            .into_iter()
            .collect(),
        );

        persist(&results, &output_file).unwrap();

        let written = fs::read_to_string(&output_file).unwrap();
        assert_eq!(
            written,
            "[\n    {\n        \"Visa\": \"Visitor\",\n        \"Fee\": \"$145\"\n    }\n]"
        );
    }
}
