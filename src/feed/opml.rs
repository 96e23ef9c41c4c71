use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashSet;
use thiserror::Error;

use crate::storage::Feed;
use crate::util::validate_url;

/// Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack-abuse from maliciously crafted deeply nested documents.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscription extracted from an OPML `<outline>` element.
///
/// The engine's bulk import consumes exactly this shape — the OPML
/// formatting stays at this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlOutline {
    /// URL of the RSS/Atom feed XML, validated as HTTP(S) and public.
    pub url: String,
    /// Display title, from the `title` attribute falling back to `text`.
    pub title: Option<String>,
}

/// Parses OPML content and extracts feed subscriptions.
///
/// Walks every `<outline>` element regardless of nesting (folders are
/// traversed but not returned), takes the `xmlUrl` attribute (accepting
/// the `xmlurl`/`url` spellings some exporters produce), and drops
/// duplicates and URLs that fail validation.
///
/// XXE is structurally impossible here: quick-xml (0.37) never parses
/// `<!ENTITY>` declarations, so custom entities error out instead of
/// expanding.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlOutline>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                if let Some(outline) = parse_outline_attributes(&e, &reader)? {
                    if seen.insert(outline.url.clone()) {
                        outlines.push(outline);
                    }
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                if let Some(outline) = parse_outline_attributes(&e, &reader)? {
                    if seen.insert(outline.url.clone()) {
                        outlines.push(outline);
                    }
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(outlines)
}

/// Extracts subscription attributes from an outline element.
///
/// Returns `None` for category/folder outlines without a feed URL and
/// for outlines whose URL fails validation.
fn parse_outline_attributes(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OpmlOutline>> {
    let mut url = None;
    let mut title = None;
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"xmlUrl" | b"xmlurl" | b"url" => {
                if url.is_none() {
                    url = Some(attr.decode_and_unescape_value(decoder)?.trim().to_string());
                }
            }
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => text = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            _ => {}
        }
    }

    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };

    match validate_url(&url) {
        Ok(_) => {
            let title = title.or(text).map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
            Ok(Some(OpmlOutline { url, title }))
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL in OPML");
            Ok(None)
        }
    }
}

/// Renders the current feed list as an OPML 2.0 document.
pub fn export_opml(feeds: &[Feed]) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("gather subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for feed in feeds {
        let display = feed.title.as_deref().unwrap_or(&feed.url);
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", display));
        outline.push_attribute(("title", display));
        outline.push_attribute(("xmlUrl", feed.url.as_str()));
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).context("OPML output was not valid UTF-8")
}
