use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use reqwest::header::CONTENT_TYPE;
use sha2::Digest as _;
use zip::write::SimpleFileOptions;

use crate::extract::UNTITLED;
use crate::formats::ExtractedArticle;
use crate::normalize::{LAZY_IMAGE_ATTRIBUTES, attribute_value};

pub const PUBLISHER: &str = "Easy-Kindle";
pub const BOOK_LANG: &str = "en";
const IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bundles extracted articles into a single document and returns its path.
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(
        &self,
        articles: &[ExtractedArticle],
        title: Option<&str>,
    ) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct EpubPackager {
    out_dir: PathBuf,
    client: reqwest::Client,
    embed_images: bool,
    /// Output paths handed out by this packager; same-titled books get numbered names.
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl EpubPackager {
    pub fn new(out_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::extract::BROWSER_USER_AGENT)
            .timeout(IMAGE_TIMEOUT)
            .build()
            .context("build image http client")?;
        Ok(Self {
            out_dir: out_dir.into(),
            client,
            embed_images: true,
            claimed: Arc::default(),
        })
    }

    /// `<title>.epub`, or `<title> (N).epub` when an earlier book of this run took the name.
    fn claim_path(&self, title: &str) -> PathBuf {
        let stem = sanitize_filename(title);
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut n = 1usize;
        loop {
            let file_name = if n == 1 {
                format!("{stem}.epub")
            } else {
                format!("{stem} ({n}).epub")
            };
            let path = self.out_dir.join(file_name);
            if claimed.insert(path.clone()) {
                return path;
            }
            n += 1;
        }
    }

    /// Keep remote image references instead of downloading them into the book.
    pub fn without_images(mut self) -> Self {
        self.embed_images = false;
        self
    }

    async fn download_images(&self, articles: &[ExtractedArticle]) -> Vec<AssetSpec> {
        let mut seen = HashSet::new();
        let mut assets = Vec::new();
        for url in articles.iter().flat_map(|a| a.image_urls.iter()) {
            if !seen.insert(url.as_str()) {
                continue;
            }
            match self.download_image(url).await {
                Ok(Some(asset)) => assets.push(asset),
                Ok(None) => tracing::debug!(url = %url, "skipping non-image response"),
                Err(err) => {
                    tracing::warn!(url = %url, error = %format!("{err:#}"), "image download failed")
                }
            }
        }
        assets
    }

    async fn download_image(&self, url: &str) -> anyhow::Result<Option<AssetSpec>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("GET {url}: HTTP {}", response.status());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        let Some(ext) = image_extension(content_type.as_deref(), url) else {
            return Ok(None);
        };

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("read image body: {url}"))?;
        Ok(Some(AssetSpec {
            source_url: url.to_owned(),
            rel_path: format!("images/{}.{ext}", image_id(url)),
            bytes: bytes.to_vec(),
        }))
    }
}

#[async_trait]
impl Packager for EpubPackager {
    async fn package(
        &self,
        articles: &[ExtractedArticle],
        title: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        if articles.is_empty() {
            anyhow::bail!("no articles to package");
        }

        let assets = if self.embed_images {
            self.download_images(articles).await
        } else {
            Vec::new()
        };

        let book = BookSpec::new(articles, title, assets);
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("create output dir: {}", self.out_dir.display()))?;
        let out_path = self.claim_path(&book.title);

        let write_path = out_path.clone();
        tokio::task::spawn_blocking(move || write_epub(&write_path, &book))
            .await
            .context("join epub writer task")??;

        tracing::info!(
            path = %out_path.display(),
            articles = articles.len(),
            "epub written"
        );
        Ok(out_path)
    }
}

pub fn book_title(articles: &[ExtractedArticle], title: Option<&str>) -> String {
    if let Some(title) = title.map(str::trim)
        && !title.is_empty()
    {
        return title.to_owned();
    }
    let first = articles
        .first()
        .map(|a| a.title.trim())
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED);
    if articles.len() > 1 {
        format!("{first} and {} more", articles.len() - 1)
    } else {
        first.to_owned()
    }
}

pub fn book_author(articles: &[ExtractedArticle]) -> String {
    let mut authors: Vec<&str> = Vec::new();
    for byline in articles.iter().map(|a| a.byline.trim()) {
        if !byline.is_empty() && !authors.contains(&byline) {
            authors.push(byline);
        }
    }
    if authors.is_empty() {
        "Unknown".to_owned()
    } else {
        authors.join(", ")
    }
}

pub fn sanitize_filename(title: &str) -> String {
    let cleaned = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    let truncated = cleaned.chars().take(120).collect::<String>();
    if truncated.is_empty() {
        UNTITLED.to_owned()
    } else {
        truncated
    }
}

#[derive(Debug)]
struct BookSpec {
    title: String,
    author: String,
    description: String,
    chapters: Vec<ChapterSpec>,
    assets: Vec<AssetSpec>,
}

impl BookSpec {
    fn new(articles: &[ExtractedArticle], title: Option<&str>, assets: Vec<AssetSpec>) -> Self {
        let local_images = assets
            .iter()
            .map(|asset| (asset.source_url.clone(), asset.rel_path.clone()))
            .collect::<HashMap<_, _>>();
        let extracted_on = Utc::now().format("%Y-%m-%d").to_string();

        let chapters = articles
            .iter()
            .enumerate()
            .map(|(idx, article)| {
                let title = match article.title.trim() {
                    "" => format!("Chapter {}", idx + 1),
                    title => title.to_owned(),
                };
                let body = format!(
                    "{}{}",
                    render_source_block(article, &extracted_on),
                    prepare_article_html(&article.html_content, &local_images)
                );
                ChapterSpec {
                    stem: format!("chapter-{:03}", idx + 1),
                    heading: title,
                    body,
                }
            })
            .collect::<Vec<_>>();

        Self {
            title: book_title(articles, title),
            author: book_author(articles),
            description: format!("Collection of {} articles", chapters.len()),
            chapters,
            assets,
        }
    }
}

#[derive(Debug)]
struct ChapterSpec {
    stem: String,
    heading: String,
    body: String,
}

#[derive(Debug)]
struct AssetSpec {
    source_url: String,
    rel_path: String,
    bytes: Vec<u8>,
}

fn write_epub(out_path: &Path, book: &BookSpec) -> anyhow::Result<()> {
    let uuid = uuid::Uuid::new_v4();
    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let out_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(out_path)
        .with_context(|| format!("open epub output: {}", out_path.display()))?;
    let mut zip = zip::ZipWriter::new(out_file);

    // `mimetype` must be the first entry and stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let entries = [
        ("META-INF/container.xml", render_container_xml()),
        (
            "OEBPS/content.opf",
            render_content_opf(book, uuid, &modified),
        ),
        ("OEBPS/nav.xhtml", render_nav_xhtml(book)),
        ("OEBPS/toc.ncx", render_toc_ncx(book, uuid)),
        ("OEBPS/style.css", default_style_css()),
    ];
    for (name, contents) in entries {
        zip.start_file(name, deflated)
            .with_context(|| format!("epub start_file {name}"))?;
        zip.write_all(contents.as_bytes())
            .with_context(|| format!("epub write {name}"))?;
    }

    for chapter in &book.chapters {
        let xhtml = wrap_xhtml_document(&chapter.heading, &chapter.body);
        zip.start_file(format!("OEBPS/{}.xhtml", chapter.stem), deflated)
            .with_context(|| format!("epub start_file chapter: {}", chapter.stem))?;
        zip.write_all(xhtml.as_bytes())
            .with_context(|| format!("epub write chapter: {}", chapter.stem))?;
    }

    for asset in &book.assets {
        zip.start_file(format!("OEBPS/{}", asset.rel_path), deflated)
            .with_context(|| format!("epub start_file asset: {}", asset.rel_path))?;
        zip.write_all(&asset.bytes)
            .with_context(|| format!("epub write asset: {}", asset.rel_path))?;
    }

    zip.finish().context("epub finish zip")?;
    Ok(())
}

fn render_source_block(article: &ExtractedArticle, extracted_on: &str) -> String {
    let mut out = String::new();
    out.push_str("<div class=\"source\">\n<p>\n");
    out.push_str(&format!(
        "<strong>Source:</strong> <a href=\"{url}\">{url}</a><br />\n",
        url = xml_escape(&article.source_url)
    ));
    if !article.byline.trim().is_empty() {
        out.push_str(&format!(
            "<strong>Author:</strong> {}<br />\n",
            xml_escape(article.byline.trim())
        ));
    }
    if let Some(published) = &article.published_time {
        out.push_str(&format!(
            "<strong>Published:</strong> {}<br />\n",
            xml_escape(published)
        ));
    }
    out.push_str(&format!(
        "<strong>Extracted:</strong> {}\n",
        xml_escape(extracted_on)
    ));
    out.push_str("</p>\n</div>\n");
    out
}

/// Strips presentation attributes and scripts, points images at their embedded copies,
/// and makes the fragment well-formed enough for XHTML.
fn prepare_article_html(html: &str, local_images: &HashMap<String, String>) -> String {
    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("script, style, noscript, iframe, form", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("[style], [class], [id]", |el| {
                    el.remove_attribute("style");
                    el.remove_attribute("class");
                    el.remove_attribute("id");
                    Ok(())
                }),
                element!("img", |el| {
                    let local = attribute_value(el, "src").and_then(|src| local_images.get(&src));
                    if let Some(local) = local {
                        el.set_attribute("src", local)?;
                    }
                    el.remove_attribute("srcset");
                    el.remove_attribute("sizes");
                    el.remove_attribute("loading");
                    for attr in LAZY_IMAGE_ATTRIBUTES {
                        el.remove_attribute(attr);
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::new()
        },
    );
    let html = match rewritten {
        Ok(html) => html,
        Err(err) => {
            tracing::warn!(?err, "article html cleanup failed; using it as-is");
            html.to_owned()
        }
    };

    ensure_xhtml_void_tags(&numeric_entities(&html))
}

fn image_extension(content_type: Option<&str>, url: &str) -> Option<&'static str> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    match mime {
        "image/png" => return Some("png"),
        "image/jpeg" | "image/jpg" => return Some("jpg"),
        "image/gif" => return Some("gif"),
        "image/svg+xml" => return Some("svg"),
        "image/webp" => return Some("webp"),
        "image/avif" => return Some("avif"),
        "" | "application/octet-stream" | "binary/octet-stream" => {}
        _ => return None,
    }

    let path = url.split(['?', '#']).next().unwrap_or_default();
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "gif" => Some("gif"),
        "svg" => Some("svg"),
        "webp" => Some("webp"),
        "avif" => Some("avif"),
        _ => None,
    }
}

fn image_id(url: &str) -> String {
    let digest = sha2::Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
p { margin-top: 1em; margin-bottom: 1em; }
h1, h2, h3, h4, h5, h6 { margin-top: 1.5em; margin-bottom: 1em; }
img { max-width: 100%; height: auto; display: block; margin: 1em auto; }
pre, code { font-family: ui-monospace, Menlo, Consolas, monospace; }
pre { overflow-x: auto; padding: 0.75em; background: #f6f8fa; }
blockquote { margin: 1em 0; padding: 0 1em; border-left: 4px solid #ddd; color: #333; }
.source { margin-bottom: 20px; padding: 10px; border-left: 3px solid #ccc; background-color: #f9f9f9; }
.source p { margin: 0; font-size: 0.9em; color: #666; }
"#
    .to_string()
}

fn render_nav_xhtml(book: &BookSpec) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{BOOK_LANG}\" xml:lang=\"{BOOK_LANG}\">\n"
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(&book.title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(&book.title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for ch in &book.chapters {
        out.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.heading)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(book: &BookSpec, uuid: uuid::Uuid) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{uuid}\" />\n"
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str(&format!(
        "  <docTitle><text>{}</text></docTitle>\n",
        xml_escape(&book.title)
    ));
    out.push_str(&format!(
        "  <docAuthor><text>{}</text></docAuthor>\n",
        xml_escape(&book.author)
    ));
    out.push_str("  <navMap>\n");
    for (idx, ch) in book.chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str(&format!(
            "      <navLabel><text>{}</text></navLabel>\n",
            xml_escape(&ch.heading)
        ));
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            xml_escape(&ch.stem)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(book: &BookSpec, uuid: uuid::Uuid, modified: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{BOOK_LANG}\">\n"
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">urn:uuid:{uuid}</dc:identifier>\n"
    ));
    out.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        xml_escape(&book.title)
    ));
    out.push_str(&format!(
        "    <dc:creator>{}</dc:creator>\n",
        xml_escape(&book.author)
    ));
    out.push_str(&format!(
        "    <dc:publisher>{}</dc:publisher>\n",
        xml_escape(PUBLISHER)
    ));
    out.push_str(&format!(
        "    <dc:description>{}</dc:description>\n",
        xml_escape(&book.description)
    ));
    out.push_str(&format!("    <dc:language>{BOOK_LANG}</dc:language>\n"));
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");

    for ch in &book.chapters {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.stem)
        ));
    }

    for (idx, asset) in book.assets.iter().enumerate() {
        out.push_str(&format!(
            "    <item id=\"asset-{}\" href=\"{}\" media-type=\"{}\" />\n",
            idx + 1,
            xml_escape(&asset.rel_path),
            media_type_for_asset(&asset.rel_path)
        ));
    }

    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for ch in &book.chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn media_type_for_asset(rel_path: &str) -> &'static str {
    let ext = Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

fn wrap_xhtml_document(title: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{BOOK_LANG}\" xml:lang=\"{BOOK_LANG}\">\n"
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("<h1>{}</h1>\n", xml_escape(title)));
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

/// XHTML only knows the five XML entities; everything else becomes a character reference.
fn numeric_entities(html: &str) -> String {
    const NAMED: &[(&str, u32)] = &[
        ("nbsp", 160),
        ("copy", 169),
        ("reg", 174),
        ("laquo", 171),
        ("raquo", 187),
        ("middot", 183),
        ("ndash", 8211),
        ("mdash", 8212),
        ("lsquo", 8216),
        ("rsquo", 8217),
        ("ldquo", 8220),
        ("rdquo", 8221),
        ("bull", 8226),
        ("hellip", 8230),
        ("trade", 8482),
    ];
    const XML: &[&str] = &["amp", "lt", "gt", "quot", "apos"];

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let name_len = tail
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(tail.len());
        let name = &tail[..name_len];
        let terminated = tail[name_len..].starts_with(';');

        if !terminated || name.is_empty() {
            // Numeric references (`&#...;`) fall through here untouched.
            if tail.starts_with('#') {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
            rest = tail;
            continue;
        }

        if XML.contains(&name) {
            out.push('&');
            out.push_str(name);
            out.push(';');
        } else if let Some((_, code)) = NAMED.iter().find(|(n, _)| *n == name) {
            out.push_str(&format!("&#{code};"));
        } else {
            out.push_str("&amp;");
            out.push_str(name);
            out.push(';');
        }
        rest = &tail[name_len + 1..];
    }
    out.push_str(rest);
    out
}

fn ensure_xhtml_void_tags(html: &str) -> String {
    // `<img ...>` becomes `<img ... />` so chapters parse as XML.
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
                gt += 1;
                continue;
            }
            if b == b'"' || b == b'\'' {
                in_quote = Some(b);
                gt += 1;
                continue;
            }
            if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            out.push_str(&html[lt..]);
            return out;
        }

        let raw_tag = &html[lt..=gt];
        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && bytes[name_end].is_ascii_alphanumeric() {
            name_end += 1;
        }
        let tag_name = html[name_start..name_end].to_ascii_lowercase();
        if tag_name.is_empty() || !VOID_TAGS.contains(&tag_name.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt.trim_end());
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    fn article(url: &str, title: &str, byline: &str) -> ExtractedArticle {
        ExtractedArticle {
            source_url: url.to_owned(),
            title: title.to_owned(),
            html_content: format!(
                "<div class=\"x\" style=\"color:red\"><p id=\"p1\">{title}&nbsp;body</p><img src=\"https://cdn.test/a.png\" srcset=\"https://cdn.test/a.png 2x\"><br></div>"
            ),
            plain_text: format!("{title} body"),
            length: title.len() + 5,
            excerpt: String::new(),
            byline: byline.to_owned(),
            published_time: None,
            image_urls: HashSet::from(["https://cdn.test/a.png".to_owned()]),
        }
    }

    #[test]
    fn title_defaults_to_first_article_and_count() {
        let one = [article("https://a.test/1", "First", "")];
        let two = [
            article("https://a.test/1", "First", ""),
            article("https://a.test/2", "Second", ""),
        ];
        assert_eq!(book_title(&one, None), "First");
        assert_eq!(book_title(&two, None), "First and 1 more");
        assert_eq!(book_title(&two, Some("Weekend")), "Weekend");
        assert_eq!(book_title(&two, Some("  ")), "First and 1 more");
    }

    #[test]
    fn author_joins_unique_bylines() {
        let articles = [
            article("https://a.test/1", "A", "Ann"),
            article("https://a.test/2", "B", ""),
            article("https://a.test/3", "C", "Bob"),
            article("https://a.test/4", "D", "Ann"),
        ];
        assert_eq!(book_author(&articles), "Ann, Bob");
        assert_eq!(book_author(&articles[1..2]), "Unknown");
    }

    #[test]
    fn filenames_lose_path_separators() {
        assert_eq!(sanitize_filename("a/b: c?"), "a_b_ c_");
        assert_eq!(sanitize_filename("..."), UNTITLED);
    }

    #[test]
    fn article_html_is_cleaned_for_xhtml() {
        let local = HashMap::from([(
            "https://cdn.test/a.png".to_owned(),
            "images/abc.png".to_owned(),
        )]);
        let html = prepare_article_html(
            "<div class=\"x\" style=\"color:red\"><p id=\"p1\">Fish&nbsp;&amp; chips</p><script>alert(1)</script><img src=\"https://cdn.test/a.png\" srcset=\"https://cdn.test/a.png 2x\" data-src=\"https://cdn.test/a.png\"><br></div>",
            &local,
        );
        assert_eq!(
            html,
            "<div><p>Fish&#160;&amp; chips</p><img src=\"images/abc.png\" /><br /></div>"
        );
    }

    #[test]
    fn escaped_image_src_maps_to_its_downloaded_copy() {
        let local = HashMap::from([(
            "https://cdn.test/a.png?w=1&h=2".to_owned(),
            "images/abc.png".to_owned(),
        )]);
        let html = prepare_article_html(
            "<p><img src=\"https://cdn.test/a.png?w=1&amp;h=2\"></p>",
            &local,
        );
        assert_eq!(html, "<p><img src=\"images/abc.png\" /></p>");
    }

    #[test]
    fn image_extension_prefers_content_type() {
        assert_eq!(image_extension(Some("image/jpeg"), "https://a.test/x.png"), Some("jpg"));
        assert_eq!(
            image_extension(Some("application/octet-stream"), "https://a.test/x.PNG?w=1"),
            Some("png")
        );
        assert_eq!(image_extension(Some("text/html"), "https://a.test/x.png"), None);
        assert_eq!(image_extension(None, "https://a.test/x"), None);
    }

    #[test]
    fn stray_ampersands_are_escaped() {
        assert_eq!(
            numeric_entities("R&D &unknown; &#38; &lt;"),
            "R&amp;D &amp;unknown; &#38; &lt;"
        );
    }

    #[test]
    fn ensure_xhtml_void_tags_preserves_utf8_text() {
        let out = ensure_xhtml_void_tags("<p>日本語のテスト</p><img src=\"x.png\"><hr/>");
        assert!(out.contains("日本語のテスト"));
        assert!(out.contains("<img src=\"x.png\" />"));
        assert!(out.contains("<hr/>"));
    }

    #[tokio::test]
    async fn packages_articles_into_an_epub() {
        let dir = tempfile::tempdir().unwrap();
        let packager = EpubPackager::new(dir.path()).unwrap().without_images();
        let articles = [
            article("https://a.test/1", "First", "Ann"),
            article("https://a.test/2", "Second", ""),
        ];

        let path = packager.package(&articles, None).await.unwrap();
        assert_eq!(path, dir.path().join("First and 1 more.epub"));

        let mut archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");

        let mut chapter = String::new();
        archive
            .by_name("OEBPS/chapter-002.xhtml")
            .unwrap()
            .read_to_string(&mut chapter)
            .unwrap();
        assert!(chapter.contains("<a href=\"https://a.test/2\">https://a.test/2</a>"));
        assert!(chapter.contains("<img src=\"https://cdn.test/a.png\" />"));

        let mut opf = String::new();
        archive
            .by_name("OEBPS/content.opf")
            .unwrap()
            .read_to_string(&mut opf)
            .unwrap();
        assert!(opf.contains("<dc:creator>Ann</dc:creator>"));
        assert!(opf.contains("<dc:description>Collection of 2 articles</dc:description>"));
    }

    #[tokio::test]
    async fn packaging_nothing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let packager = EpubPackager::new(dir.path()).unwrap().without_images();
        assert!(packager.package(&[], None).await.is_err());
    }

    #[tokio::test]
    async fn same_titled_books_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let packager = EpubPackager::new(dir.path()).unwrap().without_images();

        let first = packager
            .package(&[article("https://a.test/1", "First", "")], Some("Weekend"))
            .await
            .unwrap();
        let second = packager
            .package(&[article("https://a.test/2", "Second", "")], Some("Weekend"))
            .await
            .unwrap();

        assert_eq!(first, dir.path().join("Weekend.epub"));
        assert_eq!(second, dir.path().join("Weekend (2).epub"));
        assert!(first.is_file());
        assert!(second.is_file());
    }
}
