use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive};

use crate::error::{MetacleanError, Result};

/// Manifest ids tried, in order, when the package does not declare its cover.
const COVER_FALLBACK_IDS: [&str; 4] = ["coverimagestandard", "cover.png", "cover-image", "cover"];
/// Declared cover ids known to point at a generic placeholder.
const COVER_FALSE_POSITIVES: [&str; 1] = ["images/cover.png"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpubMetadata {
    pub title: Option<String>,
    /// Display string; multiple creators are joined with ", ".
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    pub publish_info: Option<String>,
}

/// Page, cover and metadata access to one EPUB file.
pub trait EpubContainer {
    fn path(&self) -> &Path;
    /// Manifest ids of the (X)HTML content documents, spine order first.
    fn text_pages(&self) -> Vec<String>;
    fn read_page(&self, id: &str) -> Result<String>;
    fn write_page(&mut self, id: &str, markup: &str) -> Result<()>;
    fn cover_manifest_id(&self) -> Option<String>;
    fn read_item(&self, id: &str) -> Result<Vec<u8>>;
    fn write_item(&mut self, id: &str, bytes: &[u8]) -> Result<()>;
    fn read_metadata(&self) -> EpubMetadata;
    fn write_metadata(&mut self, metadata: &EpubMetadata) -> Result<()>;
    /// Persists pending changes. A container without changes is left untouched.
    fn save(&mut self) -> Result<()>;
}

/// Opens containers for the pipeline; swapped for an in-memory fake in tests.
pub trait ContainerOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn EpubContainer>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipOpener;

impl ContainerOpener for ZipOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn EpubContainer>> {
        Ok(Box::new(EpubBook::open(path)?))
    }
}

struct ZipEntry {
    name: String,
    data: Vec<u8>,
    is_dir: bool,
    compression: CompressionMethod,
    modified: Option<zip::DateTime>,
    unix_mode: Option<u32>,
}

#[derive(Debug, Clone)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: Option<String>,
    properties: Option<String>,
}

impl ManifestItem {
    fn is_text(&self) -> bool {
        matches!(
            self.media_type.as_deref(),
            Some("application/xhtml+xml") | Some("text/html")
        )
    }

    fn is_image(&self) -> bool {
        self.media_type
            .as_deref()
            .map(|value| value.starts_with("image/"))
            .unwrap_or(true)
    }
}

/// Zip-backed EPUB held fully in memory until [`EpubContainer::save`].
pub struct EpubBook {
    path: PathBuf,
    entries: Vec<ZipEntry>,
    opf_path: String,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
    cover_meta_id: Option<String>,
    media_type_overrides: HashMap<String, String>,
    dirty: bool,
}

impl EpubBook {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| MetacleanError::unrecoverable(path, err.to_string()))?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| MetacleanError::unrecoverable(path, err.to_string()))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|err| MetacleanError::unrecoverable(path, err.to_string()))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|err| MetacleanError::unrecoverable(path, err.to_string()))?;
            entries.push(ZipEntry {
                name: file.name().to_string(),
                data,
                is_dir: file.is_dir(),
                compression: file.compression(),
                modified: file.last_modified(),
                unix_mode: file.unix_mode(),
            });
        }

        let container = entries
            .iter()
            .find(|entry| entry.name == "META-INF/container.xml")
            .ok_or_else(|| MetacleanError::unrecoverable(path, "Missing META-INF/container.xml"))?;
        let opf_path = find_opf_path(&String::from_utf8_lossy(&container.data))
            .map_err(|message| MetacleanError::unrecoverable(path, message))?;
        let opf = entries
            .iter()
            .find(|entry| entry.name == opf_path)
            .ok_or_else(|| {
                MetacleanError::unrecoverable(path, format!("Missing package document {}", opf_path))
            })?;
        let package = parse_package(&String::from_utf8_lossy(&opf.data))
            .map_err(|message| MetacleanError::unrecoverable(path, message))?;

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            opf_path,
            manifest: package.manifest,
            spine: package.spine,
            cover_meta_id: package.cover_meta_id,
            media_type_overrides: HashMap::new(),
            dirty: false,
        })
    }

    fn manifest_item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    fn entry_index_for(&self, id: &str) -> Result<usize> {
        let item = self
            .manifest_item(id)
            .ok_or_else(|| MetacleanError::parse(format!("No manifest item with id {}", id)))?;
        let opf_dir = Path::new(&self.opf_path)
            .parent()
            .map(|value| value.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let href = urlencoding::decode(&item.href)
            .map(|value| value.into_owned())
            .unwrap_or_else(|_| item.href.clone());
        let joined = if opf_dir.is_empty() {
            href.clone()
        } else {
            format!("{}/{}", opf_dir, href)
        };
        // Some packages carry hrefs that do not resolve cleanly against the OPF folder.
        let candidates = [
            normalize_zip_path(&joined),
            href.trim_start_matches("./").to_string(),
            item.href.clone(),
        ];
        candidates
            .iter()
            .find_map(|candidate| self.entries.iter().position(|entry| &entry.name == candidate))
            .ok_or_else(|| {
                MetacleanError::parse(format!("Manifest item {} points at missing {}", id, item.href))
            })
    }

    fn opf_index(&self) -> Result<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name == self.opf_path)
            .ok_or_else(|| MetacleanError::unrecoverable(&self.path, "Package document vanished"))
    }

    fn opf_text(&self) -> Result<String> {
        let index = self.opf_index()?;
        Ok(String::from_utf8_lossy(&self.entries[index].data).to_string())
    }

    fn write_zip(&self, target: &Path) -> Result<()> {
        let file = File::create(target).map_err(|err| MetacleanError::io(target, err))?;
        let mut writer = zip::ZipWriter::new(file);
        for entry in &self.entries {
            let method = match entry.compression {
                CompressionMethod::Stored => CompressionMethod::Stored,
                _ => CompressionMethod::Deflated,
            };
            let mut options = SimpleFileOptions::default()
                .compression_method(method)
                .last_modified_time(entry.modified.unwrap_or_default());
            if let Some(mode) = entry.unix_mode {
                options = options.unix_permissions(mode);
            }
            if entry.is_dir {
                writer
                    .add_directory(entry.name.as_str(), options)
                    .map_err(|err| MetacleanError::io(target, std::io::Error::other(err)))?;
                continue;
            }
            writer
                .start_file(entry.name.as_str(), options)
                .map_err(|err| MetacleanError::io(target, std::io::Error::other(err)))?;
            writer
                .write_all(&entry.data)
                .map_err(|err| MetacleanError::io(target, err))?;
        }
        writer
            .finish()
            .map_err(|err| MetacleanError::io(target, std::io::Error::other(err)))?;
        Ok(())
    }
}

impl EpubContainer for EpubBook {
    fn path(&self) -> &Path {
        &self.path
    }

    fn text_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = self
            .spine
            .iter()
            .filter(|id| self.manifest_item(id).map(|item| item.is_text()).unwrap_or(false))
            .cloned()
            .collect();
        for item in &self.manifest {
            if item.is_text() && !pages.contains(&item.id) {
                pages.push(item.id.clone());
            }
        }
        pages
    }

    fn read_page(&self, id: &str) -> Result<String> {
        let index = self.entry_index_for(id)?;
        Ok(String::from_utf8_lossy(&self.entries[index].data).to_string())
    }

    fn write_page(&mut self, id: &str, markup: &str) -> Result<()> {
        self.write_item(id, markup.as_bytes())
    }

    fn cover_manifest_id(&self) -> Option<String> {
        let declared = self
            .manifest
            .iter()
            .find(|item| {
                item.properties
                    .as_deref()
                    .map(|value| value.split_whitespace().any(|prop| prop == "cover-image"))
                    .unwrap_or(false)
            })
            .map(|item| item.id.clone())
            .or_else(|| {
                self.cover_meta_id
                    .as_ref()
                    .filter(|id| self.manifest_item(id).is_some())
                    .cloned()
            });
        if let Some(id) = declared {
            if !COVER_FALSE_POSITIVES.contains(&id.as_str()) {
                return Some(id);
            }
        }

        for fallback in COVER_FALLBACK_IDS {
            if let Some(item) = self.manifest_item(fallback) {
                if item.is_image() {
                    return Some(item.id.clone());
                }
            }
        }

        log::warn!(
            "no cover manifest entry in {}; manifest ids: {}",
            self.path.display(),
            self.manifest
                .iter()
                .map(|item| item.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        None
    }

    fn read_item(&self, id: &str) -> Result<Vec<u8>> {
        let index = self.entry_index_for(id)?;
        Ok(self.entries[index].data.clone())
    }

    fn write_item(&mut self, id: &str, bytes: &[u8]) -> Result<()> {
        let index = self.entry_index_for(id)?;
        if self.entries[index].data == bytes {
            return Ok(());
        }
        self.entries[index].data = bytes.to_vec();
        self.dirty = true;

        let declared = self.manifest_item(id).and_then(|item| item.media_type.clone());
        if let Some(actual) = sniff_image_mime(bytes) {
            if declared.as_deref().map(|value| value.starts_with("image/")).unwrap_or(false)
                && declared.as_deref() != Some(actual)
            {
                self.media_type_overrides.insert(id.to_string(), actual.to_string());
            }
        }
        Ok(())
    }

    fn read_metadata(&self) -> EpubMetadata {
        match self.opf_text() {
            Ok(opf) => parse_opf_metadata(&opf),
            Err(err) => {
                log::warn!("metadata read failed for {}: {}", self.path.display(), err);
                EpubMetadata::default()
            }
        }
    }

    fn write_metadata(&mut self, metadata: &EpubMetadata) -> Result<()> {
        let opf = self.opf_text()?;
        let updated = rewrite_opf(&opf, Some(metadata), &HashMap::new())
            .map_err(MetacleanError::parse)?;
        if updated != opf {
            let index = self.opf_index()?;
            self.entries[index].data = updated.into_bytes();
            self.dirty = true;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if !self.media_type_overrides.is_empty() {
            let opf = self.opf_text()?;
            let updated = rewrite_opf(&opf, None, &self.media_type_overrides)
                .map_err(MetacleanError::parse)?;
            let index = self.opf_index()?;
            self.entries[index].data = updated.into_bytes();
            for item in self.manifest.iter_mut() {
                if let Some(mime) = self.media_type_overrides.get(&item.id) {
                    item.media_type = Some(mime.clone());
                }
            }
            self.media_type_overrides.clear();
        }

        let temp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        if let Err(err) = self.write_zip(&temp_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }
        std::fs::rename(&temp_path, &self.path).map_err(|err| MetacleanError::io(&self.path, err))?;
        self.dirty = false;
        log::debug!("saved {}", self.path.display());
        Ok(())
    }
}

fn normalize_zip_path(value: &str) -> String {
    let value = value.replace('\\', "/");
    let mut parts: Vec<&str> = vec![];
    for part in value.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Jpeg => Some("image/jpeg"),
        image::ImageFormat::Png => Some("image/png"),
        image::ImageFormat::Gif => Some("image/gif"),
        image::ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

fn local_name(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.rsplit(':').next().unwrap_or("").to_string()
}

fn attribute(event: &BytesStart, key: &[u8]) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.to_string()))
}

fn find_opf_path(container_xml: &str) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(container_xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    // Looking for <rootfile ... full-path="OEBPS/content.opf" ... />
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                if local_name(e.name().as_ref()) == "rootfile" {
                    if let Some(path) = attribute(&e, b"full-path") {
                        return Ok(path);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => (),
        }
        buf.clear();
    }

    Err("Could not find OPF path in container.xml".to_string())
}

struct Package {
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
    cover_meta_id: Option<String>,
}

fn parse_package(opf: &str) -> std::result::Result<Package, String> {
    let mut reader = Reader::from_str(opf);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut package = Package {
        manifest: vec![],
        spine: vec![],
        cover_meta_id: None,
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match local_name(e.name().as_ref()).as_str() {
                "item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id"), attribute(&e, b"href")) {
                        package.manifest.push(ManifestItem {
                            id,
                            href,
                            media_type: attribute(&e, b"media-type"),
                            properties: attribute(&e, b"properties"),
                        });
                    }
                }
                "itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        package.spine.push(idref);
                    }
                }
                "meta" => {
                    if attribute(&e, b"name").as_deref() == Some("cover") {
                        package.cover_meta_id = attribute(&e, b"content");
                    }
                }
                _ => (),
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => (),
        }
        buf.clear();
    }

    Ok(package)
}

fn parse_opf_metadata(opf: &str) -> EpubMetadata {
    let mut reader = Reader::from_str(opf);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut metadata = EpubMetadata::default();
    let mut authors: Vec<String> = vec![];
    let mut current: Option<String> = None;
    // EPUB 3 collections: <meta property="belongs-to-collection" id="c1">
    let mut collection_id: Option<String> = None;
    let mut collection_name: Option<String> = None;
    let mut positions: HashMap<String, String> = HashMap::new();
    let mut current_refines: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = local_name(e.name().as_ref());
                if local == "meta" {
                    read_calibre_meta(&e, &mut metadata);
                    match attribute(&e, b"property").as_deref() {
                        Some("belongs-to-collection") => {
                            collection_id = attribute(&e, b"id");
                            current = Some("collection".to_string());
                        }
                        Some("group-position") => {
                            current_refines = attribute(&e, b"refines");
                            current = Some("group-position".to_string());
                        }
                        _ => current = None,
                    }
                } else {
                    current = Some(local);
                }
            }
            Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == "meta" {
                    read_calibre_meta(&e, &mut metadata);
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map(|value| value.trim().to_string()).unwrap_or_default();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                match current.as_deref() {
                    Some("title") if metadata.title.is_none() => metadata.title = Some(text),
                    Some("creator") => authors.push(text),
                    Some("date") if metadata.publish_info.is_none() => {
                        metadata.publish_info = Some(text)
                    }
                    Some("collection") if collection_name.is_none() => collection_name = Some(text),
                    Some("group-position") => {
                        if let Some(refines) = current_refines.take() {
                            positions.insert(refines.trim_start_matches('#').to_string(), text);
                        }
                    }
                    _ => (),
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(err) => {
                log::warn!("stopped reading package metadata: {}", err);
                break;
            }
            _ => (),
        }
        buf.clear();
    }

    if !authors.is_empty() {
        metadata.author = Some(authors.join(", "));
    }
    if metadata.series.is_none() {
        if let Some(name) = collection_name {
            metadata.series = Some(name);
            metadata.series_index = collection_id
                .and_then(|id| positions.get(&id).cloned())
                .and_then(|value| value.parse::<f64>().ok());
        }
    }
    metadata
}

/// Reads `<meta name="calibre:series" content="..."/>` style entries.
fn read_calibre_meta(event: &BytesStart, metadata: &mut EpubMetadata) {
    let name = attribute(event, b"name").unwrap_or_default();
    let content = attribute(event, b"content").unwrap_or_default();
    if name == "calibre:series" && metadata.series.is_none() && !content.trim().is_empty() {
        metadata.series = Some(content.trim().to_string());
    } else if name == "calibre:series_index" && metadata.series_index.is_none() {
        metadata.series_index = content.trim().parse::<f64>().ok();
    }
}

fn consume_element(reader: &mut Reader<&[u8]>, name: &[u8]) -> std::result::Result<(), String> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == name => depth += 1,
            Ok(Event::End(e)) if e.name().as_ref() == name => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn is_series_meta(event: &BytesStart) -> bool {
    local_name(event.name().as_ref()) == "meta"
        && matches!(
            attribute(event, b"name").as_deref(),
            Some("calibre:series") | Some("calibre:series_index")
        )
}

fn write_text_element<W: Write>(
    writer: &mut quick_xml::Writer<W>,
    tag: &str,
    text: &str,
) -> std::result::Result<(), String> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(|err| err.to_string())?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|err| err.to_string())?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|err| err.to_string())?;
    Ok(())
}

fn write_meta<W: Write>(
    writer: &mut quick_xml::Writer<W>,
    name: &str,
    content: &str,
) -> std::result::Result<(), String> {
    let mut element = BytesStart::new("meta");
    element.push_attribute(("name", name));
    element.push_attribute(("content", content));
    writer
        .write_event(Event::Empty(element))
        .map_err(|err| err.to_string())
}

fn with_media_type(event: &BytesStart, mime: &str) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(event.name().as_ref()).to_string();
    let mut element = BytesStart::new(name);
    for attr in event.attributes().flatten() {
        if attr.key.as_ref() == b"media-type" {
            element.push_attribute(("media-type", mime));
        } else {
            element.push_attribute(attr);
        }
    }
    element
}

/// Rewrites the package document: replaces title, creators, series and date
/// when `metadata` is given, and patches manifest media types by item id.
fn rewrite_opf(
    opf: &str,
    metadata: Option<&EpubMetadata>,
    media_types: &HashMap<String, String>,
) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(opf);
    reader.trim_text(false);
    let mut writer = quick_xml::Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut in_metadata = false;
    let mut prefix = "dc".to_string();
    let mut replaced_title = false;
    let mut replaced_date = false;

    let title = metadata.and_then(|value| value.title.as_deref());
    let date = metadata.and_then(|value| value.publish_info.as_deref());
    let authors: Vec<String> = metadata
        .and_then(|value| value.author.as_deref())
        .map(|value| {
            value
                .split(", ")
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf).map_err(|err| err.to_string())?;
        match &event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let local = local_name(&name);
                if local == "metadata" {
                    in_metadata = true;
                } else if in_metadata && metadata.is_some() {
                    let qualified = String::from_utf8_lossy(&name).to_string();
                    if let Some((head, _)) = qualified.split_once(':') {
                        if head != "opf" {
                            prefix = head.to_string();
                        }
                    }
                    if local == "title" && !replaced_title {
                        if let Some(title) = title {
                            writer
                                .write_event(Event::Start(e.clone()))
                                .map_err(|err| err.to_string())?;
                            writer
                                .write_event(Event::Text(BytesText::new(title)))
                                .map_err(|err| err.to_string())?;
                            consume_element(&mut reader, &name)?;
                            writer
                                .write_event(Event::End(BytesEnd::new(qualified)))
                                .map_err(|err| err.to_string())?;
                            replaced_title = true;
                            continue;
                        }
                    }
                    if local == "date" && !replaced_date {
                        if let Some(date) = date {
                            writer
                                .write_event(Event::Start(e.clone()))
                                .map_err(|err| err.to_string())?;
                            writer
                                .write_event(Event::Text(BytesText::new(date)))
                                .map_err(|err| err.to_string())?;
                            consume_element(&mut reader, &name)?;
                            writer
                                .write_event(Event::End(BytesEnd::new(qualified)))
                                .map_err(|err| err.to_string())?;
                            replaced_date = true;
                            continue;
                        }
                    }
                    if (local == "creator" && !authors.is_empty()) || is_series_meta(e) {
                        consume_element(&mut reader, &name)?;
                        continue;
                    }
                } else if local == "item" {
                    if let Some(mime) = attribute(e, b"id").and_then(|id| media_types.get(&id)) {
                        writer
                            .write_event(Event::Start(with_media_type(e, mime)))
                            .map_err(|err| err.to_string())?;
                        continue;
                    }
                }
            }
            Event::Empty(e) => {
                if in_metadata && metadata.is_some() && is_series_meta(e) {
                    continue;
                }
                if local_name(e.name().as_ref()) == "item" {
                    if let Some(mime) = attribute(e, b"id").and_then(|id| media_types.get(&id)) {
                        writer
                            .write_event(Event::Empty(with_media_type(e, mime)))
                            .map_err(|err| err.to_string())?;
                        continue;
                    }
                }
            }
            Event::End(e) => {
                if local_name(e.name().as_ref()) == "metadata" && in_metadata {
                    if let Some(metadata) = metadata {
                        if let (Some(title), false) = (title, replaced_title) {
                            write_text_element(&mut writer, &format!("{}:title", prefix), title)?;
                        }
                        for author in &authors {
                            write_text_element(&mut writer, &format!("{}:creator", prefix), author)?;
                        }
                        if let (Some(date), false) = (date, replaced_date) {
                            write_text_element(&mut writer, &format!("{}:date", prefix), date)?;
                        }
                        if let Some(series) = metadata.series.as_deref() {
                            write_meta(&mut writer, "calibre:series", series)?;
                            if let Some(index) = metadata.series_index {
                                write_meta(&mut writer, "calibre:series_index", &index.to_string())?;
                            }
                        }
                    }
                    in_metadata = false;
                }
            }
            _ => {}
        }
        writer.write_event(event).map_err(|err| err.to_string())?;
    }

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).map_err(|err| err.to_string())
}


#[cfg(test)]
mod tests {
    use super::fixtures::{tiny_png, write_epub, FixtureBook};
    use super::*;

    #[test]
    fn zip_paths_resolve_relative_segments() {
        assert_eq!(normalize_zip_path("OEBPS/text/../images/cover.png"), "OEBPS/images/cover.png");
        assert_eq!(normalize_zip_path("OEBPS\\.\\text\\ch1.xhtml"), "OEBPS/text/ch1.xhtml");
        assert_eq!(normalize_zip_path("/content.opf"), "content.opf");
    }

    fn sample(dir: &Path) -> PathBuf {
        let path = dir.join("book.epub");
        let mut book = FixtureBook::new("Mistborn", "Brandon Sanderson");
        book.pages = vec![
            ("ch1", "<html><body><p>One</p></body></html>".to_string()),
            ("ch2", "<html><body><p>Two</p></body></html>".to_string()),
        ];
        book.cover = Some(tiny_png());
        write_epub(&path, &book);
        path
    }

    #[test]
    fn lists_pages_in_spine_order() {
        let dir = tempfile::tempdir().unwrap();
        let book = EpubBook::open(&sample(dir.path())).unwrap();
        assert_eq!(book.text_pages(), vec!["ch1".to_string(), "ch2".to_string()]);
        assert!(book.read_page("ch2").unwrap().contains("Two"));
    }

    #[test]
    fn finds_declared_cover() {
        let dir = tempfile::tempdir().unwrap();
        let book = EpubBook::open(&sample(dir.path())).unwrap();
        assert_eq!(book.cover_manifest_id().as_deref(), Some("cover-img"));
        assert_eq!(book.read_item("cover-img").unwrap(), tiny_png());
    }

    #[test]
    fn falls_back_to_common_cover_ids_when_undeclared() {
        let opf = r#"<package><metadata/><manifest>
            <item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>
            <item id="cover-image" href="img/c.jpg" media-type="image/jpeg"/>
        </manifest><spine/></package>"#;
        let package = parse_package(opf).unwrap();
        let book = EpubBook {
            path: PathBuf::from("x.epub"),
            entries: vec![],
            opf_path: "content.opf".to_string(),
            manifest: package.manifest,
            spine: package.spine,
            cover_meta_id: package.cover_meta_id,
            media_type_overrides: HashMap::new(),
            dirty: false,
        };
        assert_eq!(book.cover_manifest_id().as_deref(), Some("cover-image"));
    }

    #[test]
    fn no_cover_entry_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.epub");
        let mut book = FixtureBook::new("Plain", "Nobody");
        book.pages = vec![("ch1", "<p>x</p>".to_string())];
        write_epub(&path, &book);
        assert!(EpubBook::open(&path).unwrap().cover_manifest_id().is_none());
    }

    #[test]
    fn reads_and_rewrites_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path());
        let mut book = EpubBook::open(&path).unwrap();
        let meta = book.read_metadata();
        assert_eq!(meta.title.as_deref(), Some("Mistborn"));
        assert_eq!(meta.author.as_deref(), Some("Brandon Sanderson"));

        book.write_metadata(&EpubMetadata {
            title: Some("The Final Empire".to_string()),
            author: Some("Brandon Sanderson, Someone Else".to_string()),
            series: Some("Mistborn".to_string()),
            series_index: Some(1.5),
            publish_info: Some("2006".to_string()),
        })
        .unwrap();
        book.save().unwrap();

        let reopened = EpubBook::open(&path).unwrap().read_metadata();
        assert_eq!(reopened.title.as_deref(), Some("The Final Empire"));
        assert_eq!(reopened.author.as_deref(), Some("Brandon Sanderson, Someone Else"));
        assert_eq!(reopened.series.as_deref(), Some("Mistborn"));
        assert_eq!(reopened.series_index, Some(1.5));
        assert_eq!(reopened.publish_info.as_deref(), Some("2006"));
    }

    #[test]
    fn reads_epub3_collections() {
        let opf = r##"<package><metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
            <dc:title>Well of Ascension</dc:title>
            <meta property="belongs-to-collection" id="c01">Mistborn</meta>
            <meta refines="#c01" property="group-position">2</meta>
        </metadata></package>"##;
        let meta = parse_opf_metadata(opf);
        assert_eq!(meta.series.as_deref(), Some("Mistborn"));
        assert_eq!(meta.series_index, Some(2.0));
    }

    #[test]
    fn writing_a_jpeg_cover_updates_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path());
        let mut book = EpubBook::open(&path).unwrap();

        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let mut jpeg = std::io::Cursor::new(Vec::new());
        img.write_to(&mut jpeg, image::ImageFormat::Jpeg).unwrap();
        book.write_item("cover-img", jpeg.get_ref()).unwrap();
        book.save().unwrap();

        let reopened = EpubBook::open(&path).unwrap();
        assert_eq!(
            reopened
                .manifest_item("cover-img")
                .and_then(|item| item.media_type.clone())
                .as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(reopened.read_item("cover-img").unwrap(), jpeg.into_inner());
    }

    #[test]
    fn save_without_changes_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path());
        let before = std::fs::read(&path).unwrap();
        let mut book = EpubBook::open(&path).unwrap();
        book.write_page("ch1", &book.read_page("ch1").unwrap()).unwrap();
        book.save().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn garbage_file_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.epub");
        std::fs::write(&path, b"not a zip").unwrap();
        let err = EpubBook::open(&path).err().unwrap();
        assert!(matches!(err, MetacleanError::UnrecoverableFile { .. }));
    }
}
