use crate::config::{SourceConfig, StationConfig};
use crate::error::{AppError, Result};
use crate::models::RawChannelRecord;
use crate::parser::Parser;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// One upstream request: a set of stations, optionally with the read key
/// needed for hidden stations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBatch {
    pub station_ids: Vec<String>,
    pub read_key: Option<String>,
}

impl RequestBatch {
    /// Request URL for this batch, replacing any query already on `base_url`.
    pub fn url(&self, base_url: &Url) -> Url {
        let mut url = base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.clear().append_pair("show", &self.station_ids.join("|"));
            if let Some(key) = &self.read_key {
                query.append_pair("key", key);
            }
        }
        url
    }
}

/// Combine stations into as few requests as possible.
///
/// Hidden stations are grouped by read key in first-seen order. Public stations
/// ride along with the first keyed request, or get a request of their own when
/// there is none.
pub fn build_request_batches(stations: &[StationConfig]) -> Vec<RequestBatch> {
    let mut public = Vec::new();
    let mut keyed: Vec<RequestBatch> = Vec::new();

    for station in stations {
        if !station.hidden {
            public.push(station.id.clone());
            continue;
        }

        let Some(key) = station.read_key.as_deref().filter(|k| !k.is_empty()) else {
            warn!("Hidden station {} has no read key, skipping", station.id);
            continue;
        };

        match keyed
            .iter_mut()
            .find(|batch| batch.read_key.as_deref() == Some(key))
        {
            Some(batch) => batch.station_ids.push(station.id.clone()),
            None => keyed.push(RequestBatch {
                station_ids: vec![station.id.clone()],
                read_key: Some(key.to_string()),
            }),
        }
    }

    if public.is_empty() {
        return keyed;
    }

    match keyed.first_mut() {
        Some(first) => first.station_ids.extend(public),
        None => keyed.push(RequestBatch {
            station_ids: public,
            read_key: None,
        }),
    }

    keyed
}

pub struct Fetcher {
    client: Client,
    base_url: Url,
    request_delay: Duration,
    max_retries: u32,
    api_issues: AtomicBool,
}

impl Fetcher {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("purpleair-fusion/0.1.0")
            .timeout(Duration::from_secs(source.timeout_seconds))
            .build()?;

        let base_url = Url::parse(source.base_url.trim_end_matches('/')).map_err(|e| {
            AppError::Config(format!("Invalid source base_url '{}': {}", source.base_url, e))
        })?;

        Ok(Self {
            client,
            base_url,
            request_delay: Duration::from_millis(source.request_delay_ms),
            max_retries: u32::try_from(source.max_retries).unwrap_or(u32::MAX),
            api_issues: AtomicBool::new(false),
        })
    }

    /// Fetch and decode the records for every batch.
    ///
    /// A batch that keeps failing is skipped so the other batches still produce
    /// data for this poll.
    pub async fn fetch_records(&self, batches: &[RequestBatch]) -> Vec<RawChannelRecord> {
        if batches.is_empty() {
            debug!("No stations to fetch");
            return Vec::new();
        }

        let mut records = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            // be nice to the free API when fetching multiple batches
            if index > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            let url = batch.url(&self.base_url);
            match self.download(url.as_str()).await {
                Ok(body) => {
                    if self.api_issues.swap(false, Ordering::Relaxed) {
                        info!("PurpleAir API responding normally");
                    }

                    match Parser::parse_response(&body) {
                        Ok((mut batch_records, stats)) => {
                            debug!(
                                "Decoded {} of {} records for stations {:?}",
                                stats.parsed_successfully, stats.total_records, batch.station_ids
                            );
                            records.append(&mut batch_records);
                        }
                        Err(e) => {
                            error!(
                                "Discarding response for stations {:?}: {}",
                                batch.station_ids, e
                            );
                        }
                    }
                }
                Err(e) => {
                    if !self.api_issues.swap(true, Ordering::Relaxed) {
                        warn!(
                            "PurpleAir API returned bad response for stations {:?}: {}",
                            batch.station_ids, e
                        );
                    } else {
                        debug!("PurpleAir API still failing: {}", e);
                    }
                }
            }
        }

        records
    }

    pub async fn download(&self, url: &str) -> Result<String> {
        debug!("Fetching {}", url);

        retry_with_backoff(self.max_retries, || async move {
            let response = self.client.get(url).send().await?;
            let response = response.error_for_status()?;
            let content = response.text().await?;
            Ok(content)
        })
        .await
    }
}

/// Retry a future with exponential backoff
async fn retry_with_backoff<F, Fut, T>(max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;

                if retries > max_retries || !is_transient(&e) {
                    return Err(e);
                }

                let delay = Duration::from_secs(2u64.pow(retries.saturating_sub(1)));
                warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries, max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Connection errors, timeouts and server errors (5xx) are worth retrying.
fn is_transient(error: &AppError) -> bool {
    match error {
        AppError::Http(reqwest_err) => {
            reqwest_err.is_timeout()
                || reqwest_err.is_connect()
                || reqwest_err
                    .status()
                    .map(|s| s.is_server_error())
                    .unwrap_or(false)
        }
        _ => false,
    }
}
