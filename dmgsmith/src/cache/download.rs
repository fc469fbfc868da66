//! Sequential downloader feeding the update cache.

use std::sync::Arc;

use async_trait::async_trait;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use super::storage::{StagedDownload, UpdateCache, friendly_name, validate_sha1};
use crate::package::Package;

/// Event buffer between the download task and its consumer.
const EVENT_BUFFER: usize = 64;

/// Progress of [`download_all`]. Per package the order is always
/// `Starting, Response, Data*, Checksumming, ChecksumProgress*` followed by
/// `ChecksumOk` or `Failed`. `AllDone` is the last event of the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    Starting {
        package: String,
    },
    Response {
        package: String,
        status: u16,
        content_length: Option<u64>,
    },
    Data {
        package: String,
        bytes_received: u64,
    },
    Checksumming {
        package: String,
    },
    ChecksumProgress {
        package: String,
        bytes_hashed: u64,
        total: u64,
    },
    ChecksumOk {
        package: String,
        sha1: String,
    },
    Failed {
        package: String,
        message: String,
    },
    AllDone,
}

/// Response headers plus a body stream.
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, BuildResult<Vec<u8>>>,
}

/// Source of update payloads.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> BuildResult<FetchResponse>;
}

// ============================================================================
// HTTP FETCHER
// ============================================================================

#[cfg(feature = "http")]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new() -> BuildResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dmgsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildError::Download(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> BuildResult<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BuildError::Download(format!("HTTP request failed: {}: {}", url, e)))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|e| {
                    BuildError::Download(format!("Failed to read from {}: {}", url, e))
                })
            })
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            body,
        })
    }
}

// ============================================================================
// DOWNLOAD QUEUE
// ============================================================================

/// Download `packages` into `cache`, one at a time, in order.
///
/// Runs on a background task and reports through the returned receiver. The
/// first failure ends the queue: `Failed` is followed directly by `AllDone`.
/// Packages without a URL or a valid digest fail the same way.
pub fn download_all(
    cache: Arc<UpdateCache>,
    packages: Vec<Package>,
    fetcher: Arc<dyn Fetcher>,
) -> mpsc::Receiver<DownloadEvent> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        for package in packages {
            let name = package.name().to_string();
            if let Err(e) = download_one(&cache, &package, fetcher.as_ref(), &tx).await {
                tracing::error!(package = %name, "Download failed: {}", e);
                let _ = tx
                    .send(DownloadEvent::Failed {
                        package: name,
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
        let _ = tx.send(DownloadEvent::AllDone).await;
    });

    rx
}

async fn download_one(
    cache: &UpdateCache,
    package: &Package,
    fetcher: &dyn Fetcher,
    tx: &mpsc::Sender<DownloadEvent>,
) -> BuildResult<()> {
    let name = package.name().to_string();
    let (url, sha1) = match (package.url(), package.sha1()) {
        (Some(url), Some(sha1)) => (url, sha1),
        _ => {
            return Err(BuildError::Download(format!(
                "{} has no download location",
                name
            )));
        }
    };

    let sha1 = validate_sha1(sha1)
        .map_err(|_| BuildError::Download(format!("{} has an invalid sha1 digest", name)))?;
    let sha1 = sha1.as_str();

    tracing::info!(package = %name, url, "Starting download");
    emit(tx, DownloadEvent::Starting {
        package: name.clone(),
    })
    .await;

    let response = fetcher.fetch(url).await?;
    emit(tx, DownloadEvent::Response {
        package: name.clone(),
        status: response.status,
        content_length: response.content_length,
    })
    .await;
    if response.status >= 400 {
        return Err(BuildError::Download(format!(
            "{} failed with HTTP {}",
            name, response.status
        )));
    }

    let mut staged = cache.stage(sha1, &friendly_name(url, sha1)).await?;
    if let Err(e) = receive_body(&name, response.body, &mut staged, tx).await {
        staged.abort().await;
        return Err(e);
    }

    emit(tx, DownloadEvent::Checksumming {
        package: name.clone(),
    })
    .await;

    // commit() reports synchronously; queue the progress unbounded and drain
    // it into the event stream alongside the hash loop.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let progress_name = name.clone();
    let commit = staged.commit(move |bytes_hashed, total| {
        let _ = progress_tx.send(DownloadEvent::ChecksumProgress {
            package: progress_name.clone(),
            bytes_hashed,
            total,
        });
    });
    let forward = async {
        while let Some(event) = progress_rx.recv().await {
            emit(tx, event).await;
        }
    };
    let (committed, ()) = tokio::join!(commit, forward);
    committed?;

    tracing::info!(package = %name, sha1, "Download verified");
    emit(tx, DownloadEvent::ChecksumOk {
        package: name,
        sha1: sha1.to_string(),
    })
    .await;
    Ok(())
}

async fn receive_body(
    name: &str,
    mut body: BoxStream<'static, BuildResult<Vec<u8>>>,
    staged: &mut StagedDownload,
    tx: &mpsc::Sender<DownloadEvent>,
) -> BuildResult<()> {
    let mut received = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        staged.write(&chunk).await?;
        received += chunk.len() as u64;
        emit(tx, DownloadEvent::Data {
            package: name.to_string(),
            bytes_received: received,
        })
        .await;
    }
    Ok(())
}

async fn emit(tx: &mpsc::Sender<DownloadEvent>, event: DownloadEvent) {
    if tx.send(event).await.is_err() {
        tracing::debug!("Download event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::collections::HashMap;

    struct StaticFetcher {
        bodies: HashMap<String, (u16, Vec<u8>)>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> BuildResult<FetchResponse> {
            let (status, body) = self
                .bodies
                .get(url)
                .cloned()
                .ok_or_else(|| BuildError::Download(format!("no route to {}", url)))?;
            let chunks: Vec<BuildResult<Vec<u8>>> = body
                .chunks(3.max(body.len() / 8))
                .map(|c| Ok(c.to_vec()))
                .collect();
            Ok(FetchResponse {
                status,
                content_length: Some(body.len() as u64),
                body: futures::stream::iter(chunks).boxed(),
            })
        }
    }

    fn update(name: &str, url: &str, data: &[u8]) -> Package {
        Package::update(
            name.into(),
            std::path::PathBuf::from(name),
            data.len() as u64,
            url.into(),
            hex::encode(Sha1::digest(data)),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn downloads_in_order_and_publishes() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(UpdateCache::new(temp.path().to_path_buf()).unwrap());
        let fetcher = Arc::new(StaticFetcher {
            bodies: HashMap::from([
                ("https://u/a.pkg".to_string(), (200, b"first".to_vec())),
                ("https://u/b.pkg".to_string(), (200, b"second".to_vec())),
            ]),
        });
        let a = update("a", "https://u/a.pkg", b"first");
        let b = update("b", "https://u/b.pkg", b"second");

        let events = collect(download_all(cache.clone(), vec![a.clone(), b.clone()], fetcher)).await;

        let starts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Starting { package } => Some(package.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(starts, ["a", "b"]);
        assert_eq!(events.last(), Some(&DownloadEvent::AllDone));
        assert!(cache.is_cached(a.sha1().unwrap()));
        assert!(cache.is_cached(b.sha1().unwrap()));

        // a's events all precede b's Starting.
        let b_start = events
            .iter()
            .position(|e| matches!(e, DownloadEvent::Starting { package } if package == "b"))
            .unwrap();
        assert!(events[..b_start]
            .iter()
            .any(|e| matches!(e, DownloadEvent::ChecksumOk { package, .. } if package == "a")));
    }

    #[tokio::test]
    async fn http_error_stops_the_queue() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(UpdateCache::new(temp.path().to_path_buf()).unwrap());
        let fetcher = Arc::new(StaticFetcher {
            bodies: HashMap::from([
                ("https://u/a.pkg".to_string(), (404, Vec::new())),
                ("https://u/b.pkg".to_string(), (200, b"second".to_vec())),
            ]),
        });
        let a = update("a", "https://u/a.pkg", b"first");
        let b = update("b", "https://u/b.pkg", b"second");

        let events = collect(download_all(cache.clone(), vec![a, b.clone()], fetcher)).await;

        let n = events.len();
        assert_eq!(
            events[n - 2],
            DownloadEvent::Failed {
                package: "a".into(),
                message: "a failed with HTTP 404".into()
            }
        );
        assert_eq!(events[n - 1], DownloadEvent::AllDone);
        assert!(!cache.is_cached(b.sha1().unwrap()));
    }

    #[tokio::test]
    async fn corrupted_payload_fails_with_checksum_message() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(UpdateCache::new(temp.path().to_path_buf()).unwrap());
        let fetcher = Arc::new(StaticFetcher {
            bodies: HashMap::from([(
                "https://u/a.pkg".to_string(),
                (200, b"tampered".to_vec()),
            )]),
        });
        let a = update("a", "https://u/a.pkg", b"original");

        let events = collect(download_all(cache.clone(), vec![a.clone()], fetcher)).await;

        let failure = events
            .iter()
            .find_map(|e| match e {
                DownloadEvent::Failed { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert!(failure.starts_with("Expected sha1 checksum "));
        assert!(!cache.is_cached(a.sha1().unwrap()));
        assert!(!cache.part_path(a.sha1().unwrap()).exists());
    }

    #[tokio::test]
    async fn malformed_digest_fails_without_fetching() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(UpdateCache::new(temp.path().to_path_buf()).unwrap());
        let fetcher = Arc::new(StaticFetcher {
            bodies: HashMap::new(),
        });
        let bad = Package::update(
            "a".into(),
            std::path::PathBuf::from("a"),
            5,
            "https://u/a.pkg".into(),
            "ééééé".into(),
        );

        let events = collect(download_all(cache, vec![bad], fetcher)).await;

        assert_eq!(
            events,
            vec![
                DownloadEvent::Failed {
                    package: "a".into(),
                    message: "a has an invalid sha1 digest".into()
                },
                DownloadEvent::AllDone,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checksum_progress_survives_a_slow_consumer() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Arc::new(UpdateCache::new(temp.path().to_path_buf()).unwrap());
        let data = vec![7u8; 60 * 1024 * 1024 + 1];
        let fetcher = Arc::new(StaticFetcher {
            bodies: HashMap::from([("https://u/big.dmg".to_string(), (200, data.clone()))]),
        });
        let big = update("big", "https://u/big.dmg", &data);
        let total = data.len() as u64;
        drop(data);

        let rx = download_all(cache.clone(), vec![big.clone()], fetcher);
        // Let hashing outrun the event buffer before anything is read.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let events = collect(rx).await;

        let checksumming = events
            .iter()
            .position(|e| matches!(e, DownloadEvent::Checksumming { .. }))
            .unwrap();
        let ok = events
            .iter()
            .position(|e| matches!(e, DownloadEvent::ChecksumOk { .. }))
            .unwrap();
        let hashed: Vec<u64> = events[checksumming + 1..ok]
            .iter()
            .map(|e| match e {
                DownloadEvent::ChecksumProgress {
                    bytes_hashed,
                    total: t,
                    ..
                } => {
                    assert_eq!(*t, total);
                    *bytes_hashed
                }
                other => panic!("unexpected event during checksum: {:?}", other),
            })
            .collect();

        assert!(hashed.len() > EVENT_BUFFER);
        assert!(hashed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(hashed.last(), Some(&total));
        assert!(cache.is_cached(big.sha1().unwrap()));
    }
}
