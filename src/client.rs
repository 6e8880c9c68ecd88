//! Command line ingestion client.
//!
//! Reads MARC source files (binary ISO 2709 or MARC-XML collections),
//! converts each record to its canonical JSON form and PUTs them to the
//! shared index in chunks. Exactly one request is in flight at a time and
//! the first failed chunk aborts the run, so the server never sees
//! out-of-order or post-failure chunks.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, LOCATION};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::marc::binary::BinaryReader;
use crate::marc::fragment::FragmentExtractor;
use crate::marc::xml::{inventory_xml_to_json, marcxml_to_record, record_to_marcxml};
use crate::marc::{CanonicalRecord, Field};
use crate::storage::{IngestEnvelope, IngestRecord};

const MODULE_ID: &str = "sharedindex-1.0.0";
const JOB_POLL_WAIT_MS: u64 = 10_000;
const JOB_POLL_LIMIT: u32 = 30;
const PROGRESS_INTERVAL: u64 = 1000;

pub const USAGE: &str = "\
Usage: client [options] [files...]
Options:
  --source <uuid>    source identifier for ingested records (required with files)
  --okapiurl <url>   service base URL (default http://localhost:9130)
  --tenant <tenant>  tenant for the X-Okapi-Tenant header (default testlib)
  --chunk <n>        records per request (default 1)
  --xsl <file>       stylesheet applied to each record's XML; repeatable,
                     applied in order, result becomes the inventory payload
  --init             create/upgrade the tenant schema before sending
  --purge            drop the tenant schema
  --help             print this text
Files ending in .xml are read as MARC-XML; .rec, .marc and .mrc as binary MARC.";

#[derive(Debug, Default)]
pub struct ClientArgs {
    pub source: Option<Uuid>,
    pub okapi_url: String,
    pub tenant: String,
    pub chunk_size: usize,
    pub stylesheets: Vec<PathBuf>,
    pub init: bool,
    pub purge: bool,
    pub help: bool,
    pub files: Vec<PathBuf>,
}

impl ClientArgs {
    /// Hand-rolled option loop. Any unknown option or option without its
    /// value is fatal rather than silently skipped.
    pub fn parse(args: &[String]) -> Result<ClientArgs> {
        let mut parsed = ClientArgs {
            okapi_url: "http://localhost:9130".to_string(),
            tenant: "testlib".to_string(),
            chunk_size: 1,
            ..ClientArgs::default()
        };
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |name: &str| -> Result<String> {
                iter.next()
                    .cloned()
                    .ok_or_else(|| Error::Argument(format!("missing value for {}", name)))
            };
            match arg.as_str() {
                "--source" => {
                    let raw = value("--source")?;
                    let id = Uuid::parse_str(&raw)
                        .map_err(|_| Error::Argument(format!("bad source uuid \"{}\"", raw)))?;
                    parsed.source = Some(id);
                }
                "--okapiurl" => parsed.okapi_url = value("--okapiurl")?,
                "--tenant" => parsed.tenant = value("--tenant")?,
                "--chunk" => {
                    let raw = value("--chunk")?;
                    parsed.chunk_size = raw
                        .parse()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| Error::Argument(format!("bad chunk size \"{}\"", raw)))?;
                }
                "--xsl" => parsed.stylesheets.push(PathBuf::from(value("--xsl")?)),
                "--init" => parsed.init = true,
                "--purge" => parsed.purge = true,
                "--help" => parsed.help = true,
                other if other.starts_with("--") => {
                    return Err(Error::Argument(format!("unknown option {}", other)));
                }
                file => parsed.files.push(PathBuf::from(file)),
            }
        }
        Ok(parsed)
    }
}

pub struct IngestionClient {
    http: reqwest::Client,
    okapi_url: String,
    source: Option<Uuid>,
    chunk_size: usize,
    stylesheets: Vec<PathBuf>,
    sequence: u64,
}

impl IngestionClient {
    pub fn new(args: &ClientArgs) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Okapi-Tenant",
            HeaderValue::from_str(&args.tenant)
                .map_err(|_| Error::Argument(format!("bad tenant \"{}\"", args.tenant)))?,
        );
        headers.insert(
            "X-Okapi-Url",
            HeaderValue::from_str(&args.okapi_url)
                .map_err(|_| Error::Argument(format!("bad url \"{}\"", args.okapi_url)))?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(IngestionClient {
            http,
            okapi_url: args.okapi_url.trim_end_matches('/').to_string(),
            source: args.source,
            chunk_size: args.chunk_size,
            stylesheets: args.stylesheets.clone(),
            sequence: 0,
        })
    }

    /// Dispatch a source file by suffix.
    pub async fn send_file(&mut self, path: &Path) -> Result<()> {
        let name = path.to_string_lossy().into_owned();
        if name.ends_with(".xml") {
            self.send_xml_file(path).await
        } else if name.ends_with(".rec") || name.ends_with(".marc") || name.ends_with(".mrc") {
            self.send_binary_file(path).await
        } else {
            Err(Error::UnsupportedFile(name))
        }
    }

    async fn send_binary_file(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mut reader = BinaryReader::new(std::io::BufReader::new(file));
        let mut chunk = Vec::new();
        while let Some(record) = reader.next_record()? {
            chunk.push(self.ingest_record(record, None).await?);
            if chunk.len() >= self.chunk_size {
                self.send_chunk(&mut chunk).await?;
            }
        }
        if !chunk.is_empty() {
            self.send_chunk(&mut chunk).await?;
        }
        Ok(())
    }

    async fn send_xml_file(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mut extractor = FragmentExtractor::new(std::io::BufReader::new(file));
        let mut chunk = Vec::new();
        while let Some(fragment) = extractor.next_fragment("record")? {
            let record = marcxml_to_record(&fragment)?;
            chunk.push(self.ingest_record(record, Some(fragment)).await?);
            if chunk.len() >= self.chunk_size {
                self.send_chunk(&mut chunk).await?;
            }
        }
        if !chunk.is_empty() {
            self.send_chunk(&mut chunk).await?;
        }
        Ok(())
    }

    /// Build one wire record: canonical MARC JSON plus, when stylesheets are
    /// configured, the transformed inventory payload.
    async fn ingest_record(
        &mut self,
        record: CanonicalRecord,
        marcxml: Option<String>,
    ) -> Result<IngestRecord> {
        let local_id = local_identifier(&record)?;
        let inventory_payload = if self.stylesheets.is_empty() {
            Some(json!({}))
        } else {
            let mut doc = marcxml.unwrap_or_else(|| record_to_marcxml(&record));
            for stylesheet in &self.stylesheets {
                doc = xslt_transform(stylesheet, &doc).await?;
            }
            Some(inventory_xml_to_json(&doc)?)
        };
        self.sequence += 1;
        if self.sequence % PROGRESS_INTERVAL == 0 {
            tracing::info!(records = self.sequence, "progress");
        }
        Ok(IngestRecord {
            local_id,
            marc_payload: Some(record.to_json()),
            inventory_payload,
        })
    }

    async fn send_chunk(&mut self, chunk: &mut Vec<IngestRecord>) -> Result<()> {
        let source_id = self
            .source
            .ok_or_else(|| Error::Argument("--source is required to send records".into()))?;
        let envelope = IngestEnvelope {
            source_id,
            records: std::mem::take(chunk),
        };
        let response = self
            .http
            .put(format!("{}/shared-index/records", self.okapi_url))
            .json(&envelope)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Client(format!(
                "ingest failed with status {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(())
    }

    /// Tenant provisioning exchange. A synchronous 200/204 completes the
    /// operation; a 201 points at a job that is polled with a fixed wait
    /// until complete, then deleted.
    pub async fn tenant_op(&self, purge: bool) -> Result<()> {
        let body = json!({ "module_to": MODULE_ID, "purge": purge });
        let response = self
            .http
            .post(format!("{}/_/tenant", self.okapi_url))
            .json(&body)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 204 => Ok(()),
            201 => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::Client("tenant job created without location".into()))?;
                let job_url = if location.starts_with("http") {
                    location.to_string()
                } else {
                    format!("{}{}", self.okapi_url, location)
                };
                self.await_job(&job_url).await
            }
            status => Err(Error::Client(format!(
                "tenant operation failed with status {}",
                status
            ))),
        }
    }

    async fn await_job(&self, job_url: &str) -> Result<()> {
        for _ in 0..JOB_POLL_LIMIT {
            let response = self
                .http
                .get(job_url)
                .query(&[("wait", JOB_POLL_WAIT_MS.to_string())])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(Error::Client(format!(
                    "tenant job poll failed with status {}",
                    response.status().as_u16()
                )));
            }
            let job: Value = response.json().await?;
            if job.get("complete").and_then(Value::as_bool) == Some(true) {
                if let Some(message) = job.get("error").and_then(Value::as_str) {
                    return Err(Error::Client(format!("tenant job failed: {}", message)));
                }
                self.http.delete(job_url).send().await?;
                return Ok(());
            }
        }
        Err(Error::Client("tenant job did not complete in time".into()))
    }
}

/// The record's 001 control field, trimmed. Records without one cannot be
/// keyed and are rejected.
fn local_identifier(record: &CanonicalRecord) -> Result<String> {
    for field in &record.fields {
        if let Field::Control { tag, value } = field {
            if tag == "001" {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Ok(trimmed.to_string());
                }
            }
        }
    }
    Err(Error::Client("record without 001 control field".into()))
}

async fn xslt_transform(stylesheet: &Path, xml: &str) -> Result<String> {
    let mut child = Command::new("xsltproc")
        .arg(stylesheet)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transform("xsltproc stdin unavailable".into()))?;
    stdin.write_all(xml.as_bytes()).await?;
    drop(stdin);
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Transform(format!(
            "xsltproc {} failed: {}",
            stylesheet.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|e| Error::Transform(e.to_string()))
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = IngestionClient::new(&args)?;
    if args.purge {
        client.tenant_op(true).await?;
    }
    if args.init {
        client.tenant_op(false).await?;
    }
    for file in &args.files {
        tracing::info!(file = %file.display(), "sending");
        client.send_file(file).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_and_files() {
        let args = ClientArgs::parse(&strings(&["a.xml", "b.mrc"])).unwrap();
        assert_eq!(args.okapi_url, "http://localhost:9130");
        assert_eq!(args.tenant, "testlib");
        assert_eq!(args.chunk_size, 1);
        assert_eq!(args.files.len(), 2);
        assert!(!args.init && !args.purge && !args.help);
    }

    #[test]
    fn options_are_applied_in_order() {
        let args = ClientArgs::parse(&strings(&[
            "--source",
            "3ff5a002-7a31-4045-9c92-fbbb2aff2d5f",
            "--chunk",
            "50",
            "--xsl",
            "first.xsl",
            "--xsl",
            "second.xsl",
            "--init",
            "records.xml",
        ]))
        .unwrap();
        assert!(args.source.is_some());
        assert_eq!(args.chunk_size, 50);
        assert_eq!(
            args.stylesheets,
            vec![PathBuf::from("first.xsl"), PathBuf::from("second.xsl")]
        );
        assert!(args.init);
    }

    #[test]
    fn unknown_option_and_missing_value_are_fatal() {
        assert!(matches!(
            ClientArgs::parse(&strings(&["--nope"])),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            ClientArgs::parse(&strings(&["--chunk"])),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            ClientArgs::parse(&strings(&["--chunk", "zero"])),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            ClientArgs::parse(&strings(&["--source", "not-a-uuid"])),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn local_identifier_comes_from_001() {
        let mut record = CanonicalRecord::new("ldr");
        record.fields.push(Field::Control {
            tag: "001".into(),
            value: "  rec42 \n".into(),
        });
        assert_eq!(local_identifier(&record).unwrap(), "rec42");

        let empty = CanonicalRecord::new("ldr");
        assert!(matches!(local_identifier(&empty), Err(Error::Client(_))));
    }
}
