//! Mailing the output directory.
//!
//! The whole output directory (reports and cover images) is packed into one
//! ZIP archive and sent as an attachment. The archive is deleted once the
//! message has been accepted by the SMTP server.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::config::{MailConfig, PathsConfig};

/// Details rendered into the message body.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub file_name: String,
    pub image_count: usize,
    pub created_at: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_archive(&self, archive: &Path, info: &ArchiveInfo) -> Result<()>;
}

/// Sends over implicit-TLS SMTP with the configured account.
pub struct SmtpMailer {
    config: MailConfig,
}

impl SmtpMailer {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }
}

fn render_body(info: &ArchiveInfo) -> String {
    format!(
        "<html><body>\
         <h1>EvilLens</h1>\
         <p>The latest detection output is attached as <b>{}</b>.</p>\
         <ul><li>Cover images: {}</li><li>Generated at: {}</li></ul>\
         <p>This message was sent automatically.</p>\
         </body></html>",
        info.file_name, info.image_count, info.created_at
    )
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_archive(&self, archive: &Path, info: &ArchiveInfo) -> Result<()> {
        let Some(password) = self.config.password() else {
            bail!("mail.password is not set (or EVILLENS_SMTP_PASSWORD)");
        };

        let bytes = tokio::fs::read(archive)
            .await
            .with_context(|| format!("failed to read {}", archive.display()))?;
        let attachment = Attachment::new(info.file_name.clone())
            .body(bytes, ContentType::parse("application/zip")?);

        let message = Message::builder()
            .from(self.config.username.parse().context("invalid sender address")?)
            .to(self.config.to.parse().context("invalid recipient address")?)
            .subject(self.config.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::html(render_body(info)))
                    .singlepart(attachment),
            )?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_server)?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(self.config.username.clone(), password))
            .build();
        transport.send(message).await.context("SMTP delivery failed")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MailOutcome {
    pub archive: String,
    pub files: usize,
    pub image_count: usize,
}

/// Keeps only characters that are safe in a file name.
fn archive_name(requested: Option<&str>) -> String {
    let stem: String = requested
        .map(|name| name.trim().trim_end_matches(".zip"))
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        format!(
            "output_backup_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        )
    } else {
        stem.to_string()
    }
}

/// Packs every file under `dir` into a new archive at `target`. Returns the
/// number of files written.
pub fn zip_directory(dir: &Path, target: &Path) -> Result<usize> {
    let file = std::fs::File::create(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut files = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.path() == target {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        zip.write_all(&bytes)?;
        files += 1;
    }
    zip.finish()?;
    Ok(files)
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .count()
        })
        .unwrap_or(0)
}

/// Zips the output directory, mails it and removes the archive on success.
/// The archive is left in `work_dir` when delivery fails.
pub async fn send_report_archive(
    paths: &PathsConfig,
    mailer: &dyn Mailer,
    zip_name: Option<&str>,
) -> Result<MailOutcome> {
    let output_dir = &paths.output_dir;
    if !output_dir.is_dir() {
        bail!("output directory does not exist: {}", output_dir.display());
    }
    std::fs::create_dir_all(&paths.work_dir)
        .with_context(|| format!("failed to create {}", paths.work_dir.display()))?;

    let file_name = format!("{}.zip", archive_name(zip_name));
    let archive: PathBuf = paths.work_dir.join(&file_name);
    let image_count = count_files(&paths.images_dir());

    let (dir, target) = (output_dir.clone(), archive.clone());
    let files = tokio::task::spawn_blocking(move || zip_directory(&dir, &target))
        .await
        .context("archive task panicked")??;

    let info = ArchiveInfo {
        file_name: file_name.clone(),
        image_count,
        created_at: crate::db::now_ts(),
    };
    mailer.send_archive(&archive, &info).await?;
    info!(archive = %file_name, files, "report archive mailed");

    if let Err(e) = std::fs::remove_file(&archive) {
        warn!(path = %archive.display(), error = %e, "failed to remove mailed archive");
    }

    Ok(MailOutcome {
        archive: file_name,
        files,
        image_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_archive(&self, archive: &Path, info: &ArchiveInfo) -> Result<()> {
            if self.fail {
                bail!("relay refused");
            }
            let file = std::fs::File::open(archive)?;
            let zip = zip::ZipArchive::new(file)?;
            let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
            names.sort();
            self.sent
                .lock()
                .unwrap()
                .push((info.file_name.clone(), names));
            Ok(())
        }
    }

    fn paths(root: &Path) -> PathsConfig {
        PathsConfig {
            inbox_dir: root.join("inbox"),
            output_dir: root.join("output"),
            images_dir: None,
            rounds_dir: root.join("rounds"),
            work_dir: root.join("tasks"),
        }
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name(Some("weekly.zip")), "weekly");
        assert_eq!(archive_name(Some("../../etc/passwd")), "etcpasswd");
        assert!(archive_name(None).starts_with("output_backup_"));
        assert!(archive_name(Some("  ")).starts_with("output_backup_"));
    }

    #[tokio::test]
    async fn test_archive_is_sent_then_removed() {
        let tmp = TempDir::new().unwrap();
        let paths = paths(tmp.path());
        std::fs::create_dir_all(paths.images_dir()).unwrap();
        std::fs::write(paths.output_dir.join("evidence_report.md"), "# r").unwrap();
        std::fs::write(paths.images_dir().join("1.jpg"), b"x").unwrap();

        let mailer = RecordingMailer::default();
        let outcome = send_report_archive(&paths, &mailer, Some("weekly"))
            .await
            .unwrap();
        assert_eq!(outcome.archive, "weekly.zip");
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.image_count, 1);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(
            sent[0].1,
            vec!["evidence_report.md".to_string(), "images/1.jpg".to_string()]
        );
        assert!(!paths.work_dir.join("weekly.zip").exists());
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_archive() {
        let tmp = TempDir::new().unwrap();
        let paths = paths(tmp.path());
        std::fs::create_dir_all(&paths.output_dir).unwrap();

        let mailer = RecordingMailer {
            fail: true,
            ..Default::default()
        };
        assert!(send_report_archive(&paths, &mailer, Some("x")).await.is_err());
        assert!(paths.work_dir.join("x.zip").exists());
    }

    #[tokio::test]
    async fn test_missing_output_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mailer = RecordingMailer::default();
        let err = send_report_archive(&paths(tmp.path()), &mailer, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("output directory"));
    }
}
