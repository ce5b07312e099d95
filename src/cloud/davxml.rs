//! WebDAV response parsing
//!
//! `DavParser` is an event-driven state machine over the elements of a
//! `PROPFIND` multistatus response or an ownCloud capabilities document.
//! `DavFeed` drives it from a namespace-aware quick-xml reader as response
//! bytes arrive, so a listing is parsed while it downloads.

use std::fmt;
use std::io::{self, BufRead, Read};

use log::debug;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

use crate::cloud::{CollectionEntry, CollectionEntryKind};

pub const DAV_NAMESPACE: &str = "DAV:";

/// Which document the parser expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavDocument {
    /// `PROPFIND` multistatus listing
    Listing,
    /// Server capabilities (`test_server`)
    Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    NotStarted,
    InDoc,
    InResponse,
    InHref,
    InResourceType,
    InContentLength,
    InVersion,
    InVersionString,
    InDavRoot,
    Complete,
    Error,
}

/// One parse event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavEvent<'a> {
    StartDocument,
    EndDocument,
    Start { ns: Option<&'a str>, name: &'a str },
    End { ns: Option<&'a str>, name: &'a str },
    Text(&'a str),
}

#[derive(Debug, Default)]
struct PendingEntry {
    path: String,
    kind: Option<CollectionEntryKind>,
    size: String,
}

/// Parser state for one response document
#[derive(Debug)]
pub struct DavParser {
    document: DavDocument,
    state: ParseState,
    error: Option<String>,
    service_path: String,
    request_path: String,
    current: PendingEntry,
    entries: Vec<CollectionEntry>,
    version: String,
    dav_root: String,
}

fn is_dav(ns: Option<&str>, name: &str, expected: &str) -> bool {
    ns == Some(DAV_NAMESPACE) && name == expected
}

impl DavParser {
    /// # Arguments
    /// * `service_path` - prefix stripped from every `href`
    /// * `request_path` - the listed collection; its own entry is skipped
    pub fn new(document: DavDocument, service_path: &str, request_path: &str) -> Self {
        Self {
            document,
            state: ParseState::NotStarted,
            error: None,
            service_path: service_path.to_string(),
            request_path: request_path.to_string(),
            current: PendingEntry::default(),
            entries: Vec::new(),
            version: String::new(),
            dav_root: String::new(),
        }
    }

    fn fail(&mut self, message: &str) {
        if self.state != ParseState::Error {
            self.state = ParseState::Error;
            self.error = Some(message.to_string());
        }
    }

    /// Advance the state machine by one event
    pub fn handle(&mut self, event: DavEvent<'_>) {
        if self.state == ParseState::Error {
            return;
        }
        match event {
            DavEvent::StartDocument => {
                if self.state != ParseState::NotStarted {
                    self.fail("Start of document encountered without ending previous document");
                } else {
                    self.state = ParseState::InDoc;
                }
            }
            DavEvent::EndDocument => self.state = ParseState::Complete,
            DavEvent::Start { ns, name } => self.start_element(ns, name),
            DavEvent::End { ns, name } => self.end_element(ns, name),
            DavEvent::Text(text) => match self.state {
                ParseState::InHref => self.current.path.push_str(text),
                ParseState::InContentLength => self.current.size.push_str(text),
                ParseState::InVersionString => self.version.push_str(text),
                ParseState::InDavRoot => self.dav_root.push_str(text),
                _ => {}
            },
        }
    }

    fn start_element(&mut self, ns: Option<&str>, name: &str) {
        match self.state {
            ParseState::NotStarted | ParseState::Complete => {
                self.fail("Element outside doc start");
            }
            ParseState::InDoc => match self.document {
                DavDocument::Capabilities if name == "version" => {
                    self.state = ParseState::InVersion;
                }
                DavDocument::Capabilities if name == "webdav-root" => {
                    self.state = ParseState::InDavRoot;
                }
                DavDocument::Listing if is_dav(ns, name, "response") => {
                    self.state = ParseState::InResponse;
                }
                _ => {}
            },
            ParseState::InVersion => {
                if name == "string" {
                    self.state = ParseState::InVersionString;
                }
            }
            ParseState::InResponse => {
                if is_dav(ns, name, "href") {
                    self.state = ParseState::InHref;
                } else if is_dav(ns, name, "resourcetype") {
                    self.state = ParseState::InResourceType;
                } else if is_dav(ns, name, "getcontentlength") {
                    self.state = ParseState::InContentLength;
                }
            }
            ParseState::InHref
            | ParseState::InContentLength
            | ParseState::InVersionString
            | ParseState::InDavRoot => {
                self.fail("Unexpected element inside text element");
            }
            ParseState::InResourceType => {
                if is_dav(ns, name, "collection") {
                    self.current.kind = Some(CollectionEntryKind::Collection);
                }
            }
            ParseState::Error => {}
        }
    }

    fn end_element(&mut self, ns: Option<&str>, name: &str) {
        match self.state {
            ParseState::NotStarted | ParseState::Complete => {
                self.fail("Element outside doc start");
            }
            ParseState::InVersion if name == "version" => self.state = ParseState::InDoc,
            ParseState::InVersionString if name == "string" => {
                self.state = ParseState::InVersion;
            }
            ParseState::InDavRoot if name == "webdav-root" => self.state = ParseState::InDoc,
            ParseState::InResponse if is_dav(ns, name, "response") => {
                self.state = ParseState::InDoc;
                self.push_entry();
            }
            ParseState::InHref if is_dav(ns, name, "href") => self.state = ParseState::InResponse,
            ParseState::InResourceType if is_dav(ns, name, "resourcetype") => {
                self.state = ParseState::InResponse;
            }
            ParseState::InContentLength if is_dav(ns, name, "getcontentlength") => {
                self.state = ParseState::InResponse;
            }
            _ => {}
        }
    }

    fn push_entry(&mut self) {
        let pending = std::mem::take(&mut self.current);
        let path = pending
            .path
            .strip_prefix(self.service_path.as_str())
            .unwrap_or(&pending.path)
            .to_string();
        if path == self.request_path {
            return;
        }
        let size = pending.size.trim().parse::<u64>().ok();
        let kind = pending.kind.unwrap_or(CollectionEntryKind::File);
        self.entries.push(CollectionEntry::new(kind, path, size));
    }

    /// Drive the state machine over a complete document
    pub fn parse_document(&mut self, xml: &[u8]) {
        let mut feed = DavFeed::new();
        feed.feed(self, xml);
        feed.finish(self);
    }

    /// Error text if parsing failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    pub fn take_entries(&mut self) -> Vec<CollectionEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Server version string from a capabilities document
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dav_root(&self) -> &str {
        &self.dav_root
    }
}

fn namespace_of(resolved: ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) => Some(String::from_utf8_lossy(ns).into_owned()),
        _ => None,
    }
}

/// Kind of construct the boundary scanner is inside
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Markup {
    #[default]
    Text,
    Tag(Option<u8>),
    Comment,
    CData,
    Instruction,
    Doctype(usize),
}

const COMMENT_OPEN: &[u8] = b"<!--";
const CDATA_OPEN: &[u8] = b"<![CDATA[";

fn is_partial(at: &[u8], open: &[u8]) -> bool {
    at.len() < open.len() && open.starts_with(at)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Growing input that only exposes bytes up to the last complete markup
///
/// The XML reader treats an empty buffer as end of input, so it must never
/// see a construct that the next chunk would finish.
#[derive(Debug, Default)]
struct ChunkSource {
    data: Vec<u8>,
    pos: usize,
    ready: usize,
    scan: usize,
    markup: Markup,
}

impl ChunkSource {
    fn push(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.ready -= self.pos;
            self.scan -= self.pos;
            self.pos = 0;
        }
        self.data.extend_from_slice(chunk);
        self.advance();
    }

    /// Expose everything, including an unterminated tail
    fn finish(&mut self) {
        self.ready = self.data.len();
        self.scan = self.data.len();
    }

    fn available(&self) -> usize {
        self.ready - self.pos
    }

    fn close(&mut self, end: usize) {
        self.markup = Markup::Text;
        self.scan = end;
        self.ready = end;
    }

    fn close_at(&mut self, terminator: &[u8]) -> bool {
        match find(&self.data[self.scan..], terminator) {
            Some(i) => {
                self.close(self.scan + i + terminator.len());
                true
            }
            None => {
                self.scan = self.scan.max(self.data.len().saturating_sub(terminator.len() - 1));
                false
            }
        }
    }

    fn advance(&mut self) {
        while self.scan < self.data.len() {
            match self.markup {
                Markup::Text => {
                    let Some(i) = self.data[self.scan..].iter().position(|b| *b == b'<') else {
                        self.scan = self.data.len();
                        return;
                    };
                    self.scan += i;
                    let at = &self.data[self.scan..];
                    if is_partial(at, COMMENT_OPEN) || is_partial(at, CDATA_OPEN) {
                        return;
                    }
                    let (markup, skip) = if at.starts_with(COMMENT_OPEN) {
                        (Markup::Comment, COMMENT_OPEN.len())
                    } else if at.starts_with(CDATA_OPEN) {
                        (Markup::CData, CDATA_OPEN.len())
                    } else if at.starts_with(b"<?") {
                        (Markup::Instruction, 2)
                    } else if at.starts_with(b"<!") {
                        (Markup::Doctype(0), 2)
                    } else {
                        (Markup::Tag(None), 1)
                    };
                    self.markup = markup;
                    self.scan += skip;
                }
                Markup::Tag(mut quote) => {
                    let start = self.scan;
                    let mut end = None;
                    for (i, b) in self.data[start..].iter().enumerate() {
                        match (quote, *b) {
                            (Some(q), b) if b == q => quote = None,
                            (Some(_), _) => {}
                            (None, b @ (b'"' | b'\'')) => quote = Some(b),
                            (None, b'>') => {
                                end = Some(start + i + 1);
                                break;
                            }
                            (None, _) => {}
                        }
                    }
                    match end {
                        Some(end) => self.close(end),
                        None => {
                            self.markup = Markup::Tag(quote);
                            self.scan = self.data.len();
                        }
                    }
                }
                Markup::Comment => {
                    if !self.close_at(b"-->") {
                        return;
                    }
                }
                Markup::CData => {
                    if !self.close_at(b"]]>") {
                        return;
                    }
                }
                Markup::Instruction => {
                    if !self.close_at(b"?>") {
                        return;
                    }
                }
                Markup::Doctype(mut depth) => {
                    let start = self.scan;
                    let mut end = None;
                    for (i, b) in self.data[start..].iter().enumerate() {
                        match *b {
                            b'[' => depth += 1,
                            b']' => depth = depth.saturating_sub(1),
                            b'>' if depth == 0 => {
                                end = Some(start + i + 1);
                                break;
                            }
                            _ => {}
                        }
                    }
                    match end {
                        Some(end) => self.close(end),
                        None => {
                            self.markup = Markup::Doctype(depth);
                            self.scan = self.data.len();
                        }
                    }
                }
            }
        }
    }
}

impl Read for ChunkSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.available().min(out.len());
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl BufRead for ChunkSource {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(&self.data[self.pos..self.ready])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.ready);
    }
}

/// Feeds a `DavParser` from response bytes as they arrive
pub struct DavFeed {
    reader: NsReader<ChunkSource>,
    buf: Vec<u8>,
    depth: usize,
    started: bool,
}

impl Default for DavFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DavFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DavFeed")
            .field("buffered", &self.reader.get_ref().data.len())
            .field("depth", &self.depth)
            .field("started", &self.started)
            .finish()
    }
}

impl DavFeed {
    pub fn new() -> Self {
        Self {
            reader: NsReader::from_reader(ChunkSource::default()),
            buf: Vec::new(),
            depth: 0,
            started: false,
        }
    }

    fn start(&mut self, parser: &mut DavParser) {
        if !self.started {
            self.started = true;
            parser.handle(DavEvent::StartDocument);
        }
    }

    /// Parse every complete construct in `data` plus what was held back
    ///
    /// Nothing is buffered once the parser has failed.
    pub fn feed(&mut self, parser: &mut DavParser, data: &[u8]) {
        self.start(parser);
        if parser.state == ParseState::Error {
            return;
        }
        self.reader.get_mut().push(data);
        self.drain(parser, false);
    }

    /// Parse the rest and close the document
    pub fn finish(&mut self, parser: &mut DavParser) {
        self.start(parser);
        if parser.state == ParseState::Error {
            return;
        }
        self.reader.get_mut().finish();
        self.drain(parser, true);
    }

    fn drain(&mut self, parser: &mut DavParser, at_end: bool) {
        loop {
            if parser.state == ParseState::Error {
                return;
            }
            if !at_end && self.reader.get_ref().available() == 0 {
                return;
            }
            self.buf.clear();
            let (ns, event) = match self.reader.read_resolved_event_into(&mut self.buf) {
                Ok((resolved, event)) => (namespace_of(resolved), event),
                Err(e) => {
                    debug!("WebDAV response is not well formed: {}", e);
                    parser.fail("XML parsing error");
                    return;
                }
            };
            match event {
                Event::Start(e) => {
                    self.depth += 1;
                    let local = e.local_name();
                    let name = String::from_utf8_lossy(local.as_ref());
                    parser.handle(DavEvent::Start {
                        ns: ns.as_deref(),
                        name: &name,
                    });
                }
                Event::Empty(e) => {
                    let local = e.local_name();
                    let name = String::from_utf8_lossy(local.as_ref());
                    parser.handle(DavEvent::Start {
                        ns: ns.as_deref(),
                        name: &name,
                    });
                    parser.handle(DavEvent::End {
                        ns: ns.as_deref(),
                        name: &name,
                    });
                }
                Event::End(e) => {
                    self.depth = self.depth.saturating_sub(1);
                    let local = e.local_name();
                    let name = String::from_utf8_lossy(local.as_ref());
                    parser.handle(DavEvent::End {
                        ns: ns.as_deref(),
                        name: &name,
                    });
                }
                Event::Text(t) => match t.unescape() {
                    Ok(text) => parser.handle(DavEvent::Text(&text)),
                    Err(e) => {
                        debug!("Bad text in WebDAV response: {}", e);
                        parser.fail("XML parsing error");
                        return;
                    }
                },
                Event::CData(c) => {
                    let text = String::from_utf8_lossy(&c);
                    parser.handle(DavEvent::Text(&text));
                }
                Event::Eof if self.depth > 0 => {
                    debug!("WebDAV response ended inside an element");
                    parser.fail("XML parsing error");
                    return;
                }
                Event::Eof => {
                    parser.handle(DavEvent::EndDocument);
                    return;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multistatus(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><d:multistatus xmlns:d="DAV:">{}</d:multistatus>"#,
            body
        )
    }

    #[test]
    fn test_collection_entry_below_service_path() {
        let xml = multistatus(
            "<d:response><d:href>/base/sub/</d:href><d:propstat><d:prop>\
             <d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>",
        );
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        parser.parse_document(xml.as_bytes());
        assert!(parser.is_complete());
        assert_eq!(
            parser.take_entries(),
            vec![CollectionEntry::new(CollectionEntryKind::Collection, "/sub/", None)]
        );
    }

    #[test]
    fn test_listing_skips_self_and_reads_sizes() {
        let xml = multistatus(
            "<d:response><d:href>/base/sub/</d:href><d:propstat><d:prop>\
             <d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>\
             <d:response><d:href>/base/sub/a.zip</d:href><d:propstat><d:prop>\
             <d:resourcetype/><d:getcontentlength>1234</d:getcontentlength></d:prop></d:propstat></d:response>\
             <d:response><d:href>/base/sub/b.txt</d:href><d:propstat><d:prop>\
             <d:getcontentlength>n/a</d:getcontentlength></d:prop></d:propstat></d:response>",
        );
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/sub/");
        parser.parse_document(xml.as_bytes());
        assert_eq!(parser.error(), None);
        assert_eq!(
            parser.take_entries(),
            vec![
                CollectionEntry::new(CollectionEntryKind::File, "/sub/a.zip", Some(1234)),
                CollectionEntry::new(CollectionEntryKind::File, "/sub/b.txt", None),
            ]
        );
    }

    #[test]
    fn test_elements_outside_dav_namespace_ignored() {
        let xml = r#"<multistatus><response><href>/base/x</href></response></multistatus>"#;
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        parser.parse_document(xml.as_bytes());
        assert!(parser.is_complete());
        assert!(parser.take_entries().is_empty());
    }

    #[test]
    fn test_element_inside_href_is_error() {
        let xml = multistatus("<d:response><d:href>/base/<d:b/></d:href></d:response>");
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        parser.parse_document(xml.as_bytes());
        assert_eq!(parser.error(), Some("Unexpected element inside text element"));
    }

    #[test]
    fn test_malformed_xml() {
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        parser.parse_document(b"<d:multistatus xmlns:d=\"DAV:\"><d:response></d:multistatus>");
        assert_eq!(parser.error(), Some("XML parsing error"));
    }

    #[test]
    fn test_capabilities_version() {
        let xml = "<?xml version=\"1.0\"?><ocs><meta><status>ok</status></meta><data>\
                   <version><major>10</major><string>10.0.3</string></version>\
                   <capabilities><core><webdav-root>remote.php/webdav</webdav-root></core></capabilities>\
                   </data></ocs>";
        let mut parser = DavParser::new(DavDocument::Capabilities, "/remote.php/webdav", "/");
        parser.parse_document(xml.as_bytes());
        assert!(parser.is_complete());
        assert_eq!(parser.version(), "10.0.3");
    }

    #[test]
    fn test_second_document_start_is_error() {
        let mut parser = DavParser::new(DavDocument::Listing, "", "/");
        parser.handle(DavEvent::StartDocument);
        parser.handle(DavEvent::StartDocument);
        assert_eq!(
            parser.error(),
            Some("Start of document encountered without ending previous document")
        );
    }

    #[test]
    fn test_end_before_document_start_is_error() {
        let mut parser = DavParser::new(DavDocument::Listing, "", "/");
        parser.handle(DavEvent::End {
            ns: Some(DAV_NAMESPACE),
            name: "response",
        });
        assert_eq!(parser.error(), Some("Element outside doc start"));
    }

    fn chunked_listing() -> String {
        multistatus(
            "<d:response><d:href>/base/a.zip</d:href><d:propstat><d:prop>\
             <d:getcontentlength>42</d:getcontentlength></d:prop></d:propstat></d:response>\
             <!-- generated > by test -->\
             <d:response><d:href><![CDATA[/base/b&c.txt]]></d:href>\
             <d:propstat status='x>y'><d:prop><d:resourcetype/></d:prop></d:propstat></d:response>",
        )
    }

    #[test]
    fn test_listing_fed_one_byte_at_a_time() {
        let xml = chunked_listing();
        let mut whole = DavParser::new(DavDocument::Listing, "/base", "/");
        whole.parse_document(xml.as_bytes());
        assert!(whole.is_complete());

        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        let mut feed = DavFeed::new();
        for byte in xml.as_bytes().chunks(1) {
            feed.feed(&mut parser, byte);
        }
        feed.finish(&mut parser);
        assert_eq!(parser.error(), None);
        assert!(parser.is_complete());
        assert_eq!(parser.take_entries(), whole.take_entries());
    }

    #[test]
    fn test_entries_parsed_before_body_ends() {
        let xml = chunked_listing();
        let split = xml.find("<!--").unwrap() + 3;
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        let mut feed = DavFeed::new();
        feed.feed(&mut parser, &xml.as_bytes()[..split]);
        assert_eq!(
            parser.entries,
            vec![CollectionEntry::new(CollectionEntryKind::File, "/a.zip", Some(42))]
        );
        assert!(!parser.is_complete());

        feed.feed(&mut parser, &xml.as_bytes()[split..]);
        feed.finish(&mut parser);
        assert!(parser.is_complete());
        assert_eq!(
            parser.take_entries(),
            vec![
                CollectionEntry::new(CollectionEntryKind::File, "/a.zip", Some(42)),
                CollectionEntry::new(CollectionEntryKind::File, "/b&c.txt", None),
            ]
        );
    }

    #[test]
    fn test_truncated_body_fails_at_finish() {
        let xml = chunked_listing();
        let mut parser = DavParser::new(DavDocument::Listing, "/base", "/");
        let mut feed = DavFeed::new();
        feed.feed(&mut parser, &xml.as_bytes()[..xml.len() / 2]);
        assert_eq!(parser.error(), None);
        feed.finish(&mut parser);
        assert_eq!(parser.error(), Some("XML parsing error"));
    }
}
