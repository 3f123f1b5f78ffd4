use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A cached daily EUR quote
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuote {
    pub price: Decimal,
    pub source_tag: String,
}

/// One headerless shard line: `YYYY-MM-DD,ASSET,price_eur,source_tag`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheLine {
    day: NaiveDate,
    asset: String,
    price: Decimal,
    source_tag: String,
}

/// On-disk daily price store: one CSV shard per `(asset, year-month)`, each
/// line `YYYY-MM-DD,ASSET,price_eur,source_tag`. The store is append-only;
/// duplicate `(asset, day)` lines resolve to the first one seen. Commits go
/// through a temp file and an atomic rename so concurrent readers always see
/// a consistent shard.
pub struct PriceCache {
    dir: PathBuf,
    entries: HashMap<(String, NaiveDate), CachedQuote>,
    shards: HashMap<String, Vec<CacheLine>>,
    dirty: HashSet<String>,
}

impl PriceCache {
    /// Open a cache directory, loading every existing shard. A missing
    /// directory is an empty cache; it is created on first commit.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<PriceCache> {
        let dir = dir.into();
        let mut cache = PriceCache {
            dir,
            entries: HashMap::new(),
            shards: HashMap::new(),
            dirty: HashSet::new(),
        };

        if cache.dir.is_dir() {
            let mut paths: Vec<PathBuf> = fs::read_dir(&cache.dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
                .collect();
            paths.sort();
            for path in paths {
                cache.load_shard(&path)?;
            }
        }

        log::debug!(
            "price cache opened with {} entries from {}",
            cache.entries.len(),
            cache.dir.display()
        );
        Ok(cache)
    }

    fn load_shard(&mut self, path: &Path) -> std::io::Result<()> {
        let shard_key = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => return Ok(()),
        };
        let file = fs::File::open(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);
        for (line_no, result) in rdr.deserialize::<CacheLine>().enumerate() {
            let mut line = match result {
                Ok(line) => line,
                Err(err) => {
                    log::warn!(
                        "skipping malformed cache line {}:{}: {err}",
                        path.display(),
                        line_no + 1
                    );
                    continue;
                }
            };
            line.asset = line.asset.trim().to_uppercase();
            if line.asset.is_empty() || line.price <= Decimal::ZERO {
                log::warn!(
                    "skipping malformed cache line {}:{}",
                    path.display(),
                    line_no + 1
                );
                continue;
            }
            self.record_line(&shard_key, line);
        }
        Ok(())
    }

    fn record_line(&mut self, shard_key: &str, line: CacheLine) {
        let key = (line.asset.clone(), line.day);
        // First line wins; later duplicates stay on disk but are inert.
        self.entries.entry(key).or_insert_with(|| CachedQuote {
            price: line.price,
            source_tag: line.source_tag.clone(),
        });
        self.shards
            .entry(shard_key.to_string())
            .or_default()
            .push(line);
    }

    pub fn get(&self, asset: &str, day: NaiveDate) -> Option<&CachedQuote> {
        self.entries.get(&(asset.to_string(), day))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a quote. A no-op when the `(asset, day)` key is already present.
    pub fn insert(&mut self, asset: &str, day: NaiveDate, price: Decimal, source_tag: &str) {
        let key = (asset.to_string(), day);
        if self.entries.contains_key(&key) {
            return;
        }
        self.entries.insert(
            key,
            CachedQuote {
                price,
                source_tag: source_tag.to_string(),
            },
        );
        let shard_key = shard_key(asset, day);
        self.shards.entry(shard_key.clone()).or_default().push(CacheLine {
            day,
            asset: asset.to_string(),
            price,
            source_tag: source_tag.to_string(),
        });
        self.dirty.insert(shard_key);
    }

    /// Flush dirty shards to disk via write-to-temp then atomic rename.
    pub fn commit(&mut self) -> std::io::Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let dirty: Vec<String> = self.dirty.iter().cloned().collect();
        for shard_key in dirty {
            let lines = match self.shards.get(&shard_key) {
                Some(lines) => lines,
                None => continue,
            };
            let final_path = self.dir.join(format!("{shard_key}.csv"));
            let tmp_path = self.dir.join(format!("{shard_key}.csv.tmp"));
            let mut wtr = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            for line in lines {
                wtr.serialize(line).map_err(csv_to_io)?;
            }
            let buffer = wtr
                .into_inner()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            {
                let mut file = fs::File::create(&tmp_path)?;
                file.write_all(&buffer)?;
                file.sync_all()?;
            }
            fs::rename(&tmp_path, &final_path)?;
            self.dirty.remove(&shard_key);
        }
        Ok(())
    }
}

fn shard_key(asset: &str, day: NaiveDate) -> String {
    format!("{}-{}", asset, day.format("%Y-%m"))
}

fn csv_to_io(err: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}
