//! Tag-scoped RSS 2.0 / Atom extraction.
//!
//! This is pattern matching over the document text, not a validating XML
//! parser. Namespaced elements are matched by their literal prefixed name
//! (`dc:creator`), so documents that bind the namespace to another prefix
//! are not recognised.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
}

/// Fields extracted from one `<item>` or `<entry>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub pub_date: Option<String>,
    pub guid: Option<String>,
    pub author: Option<String>,
    pub categories: Vec<String>,
}

impl FeedItem {
    /// Identity used for de-duplication: guid, then link, then title.
    pub fn key(&self) -> Option<&str> {
        [&self.guid, &self.link, &self.title]
            .into_iter()
            .find_map(|field| field.as_deref())
    }

    pub fn to_data(&self, feed_url: &str) -> Value {
        json!({
            "title": self.title,
            "link": self.link,
            "description": self.description,
            "pubDate": self.pub_date,
            "guid": self.guid,
            "author": self.author,
            "categories": self.categories,
            "feedUrl": feed_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub format: FeedFormat,
    pub items: Vec<FeedItem>,
}

const TAGS: &[&str] = &[
    "title",
    "link",
    "description",
    "pubDate",
    "guid",
    "author",
    "dc:creator",
    "category",
    "id",
    "summary",
    "content",
    "published",
    "updated",
    "name",
];

const ATTRS: &[&str] = &["rel", "href", "term"];

/// Compiled extraction patterns.
pub struct FeedParser {
    root: Regex,
    rss_item: Regex,
    atom_entry: Regex,
    cdata: Regex,
    link_element: Regex,
    category_element: Regex,
    tags: HashMap<&'static str, Regex>,
    attrs: HashMap<&'static str, Regex>,
}

impl FeedParser {
    pub fn new() -> Result<Self> {
        let mut tags = HashMap::new();
        for tag in TAGS {
            let escaped = regex::escape(tag);
            let pattern = format!(r"(?s)<{0}(?:\s[^>]*)?>(.*?)</{0}\s*>", escaped);
            tags.insert(*tag, Regex::new(&pattern).with_context(|| format!("pattern for <{}>", tag))?);
        }

        let mut attrs = HashMap::new();
        for attr in ATTRS {
            let pattern = format!(r#"\b{}\s*=\s*(?:"([^"]*)"|'([^']*)')"#, regex::escape(attr));
            attrs.insert(*attr, Regex::new(&pattern).with_context(|| format!("pattern for @{}", attr))?);
        }

        Ok(Self {
            root: Regex::new(r"<([A-Za-z_][\w.:-]*)")?,
            rss_item: Regex::new(r"(?s)<item(?:\s[^>]*)?>(.*?)</item\s*>")?,
            atom_entry: Regex::new(r"(?s)<entry(?:\s[^>]*)?>(.*?)</entry\s*>")?,
            cdata: Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>")?,
            link_element: Regex::new(r"<link\b[^>]*>")?,
            category_element: Regex::new(r"<category\b[^>]*>")?,
            tags,
            attrs,
        })
    }

    /// Detects the format from the root element and extracts every item.
    pub fn parse(&self, xml: &str) -> Result<Feed> {
        let root = self
            .root
            .captures(xml)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| anyhow!("document has no root element"))?;

        let format = match root {
            "feed" => FeedFormat::Atom,
            "rss" | "rdf:RDF" | "RDF" => FeedFormat::Rss,
            other if other.ends_with(":feed") => FeedFormat::Atom,
            other => return Err(anyhow!("unrecognized feed root element <{}>", other)),
        };

        let items = match format {
            FeedFormat::Rss => self
                .rss_item
                .captures_iter(xml)
                .filter_map(|c| c.get(1))
                .map(|block| self.rss_fields(block.as_str()))
                .collect(),
            FeedFormat::Atom => self
                .atom_entry
                .captures_iter(xml)
                .filter_map(|c| c.get(1))
                .map(|block| self.atom_fields(block.as_str()))
                .collect(),
        };

        Ok(Feed { format, items })
    }

    fn rss_fields(&self, block: &str) -> FeedItem {
        FeedItem {
            title: self.element(block, "title"),
            link: self.element(block, "link"),
            description: self.element(block, "description"),
            pub_date: self.element(block, "pubDate"),
            guid: self.element(block, "guid"),
            author: self
                .element(block, "author")
                .or_else(|| self.element(block, "dc:creator")),
            categories: self.elements(block, "category"),
        }
    }

    fn atom_fields(&self, block: &str) -> FeedItem {
        let author = self
            .inner(block, "author")
            .and_then(|author| self.element(author, "name"));
        let categories = self
            .category_element
            .find_iter(block)
            .filter_map(|m| self.attr(m.as_str(), "term"))
            .collect();

        FeedItem {
            title: self.element(block, "title"),
            link: self.atom_link(block),
            description: self
                .element(block, "summary")
                .or_else(|| self.element(block, "content")),
            pub_date: self
                .element(block, "published")
                .or_else(|| self.element(block, "updated")),
            guid: self.element(block, "id"),
            author,
            categories,
        }
    }

    /// `rel="alternate"` first, then a link without `rel`, then any href.
    fn atom_link(&self, block: &str) -> Option<String> {
        let links: Vec<(Option<String>, String)> = self
            .link_element
            .find_iter(block)
            .filter_map(|m| {
                let href = self.attr(m.as_str(), "href")?;
                Some((self.attr(m.as_str(), "rel"), href))
            })
            .collect();

        links
            .iter()
            .find(|(rel, _)| rel.as_deref() == Some("alternate"))
            .or_else(|| links.iter().find(|(rel, _)| rel.is_none()))
            .or_else(|| links.first())
            .map(|(_, href)| href.clone())
    }

    /// Raw contents of the first `<tag>` in `block`.
    fn inner<'a>(&self, block: &'a str, tag: &str) -> Option<&'a str> {
        self.tags
            .get(tag)?
            .captures(block)?
            .get(1)
            .map(|m| m.as_str())
    }

    /// Text of the first `<tag>`; `None` when absent or blank.
    fn element(&self, block: &str, tag: &str) -> Option<String> {
        self.inner(block, tag)
            .map(|raw| self.text(raw))
            .filter(|text| !text.is_empty())
    }

    fn elements(&self, block: &str, tag: &str) -> Vec<String> {
        let Some(pattern) = self.tags.get(tag) else {
            return Vec::new();
        };
        pattern
            .captures_iter(block)
            .filter_map(|c| c.get(1))
            .map(|m| self.text(m.as_str()))
            .filter(|text| !text.is_empty())
            .collect()
    }

    fn attr(&self, element: &str, name: &str) -> Option<String> {
        let captures = self.attrs.get(name)?.captures(element)?;
        captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| decode_entities(m.as_str()))
    }

    /// CDATA sections are taken verbatim; everything else is entity-decoded.
    fn text(&self, raw: &str) -> String {
        let mut out = String::new();
        let mut rest = 0;
        for captures in self.cdata.captures_iter(raw) {
            let (Some(whole), Some(body)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            out.push_str(&decode_entities(&raw[rest..whole.start()]));
            out.push_str(body.as_str());
            rest = whole.end();
        }
        out.push_str(&decode_entities(&raw[rest..]));
        out.trim().to_string()
    }
}

/// Decodes the predefined XML entities; `&amp;` last so it cannot create new ones.
pub fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example Blog</title>
    <link>https://example.com</link>
    <item>
      <title><![CDATA[Rust & <Tokio>]]></title>
      <link>https://example.com/posts/1</link>
      <description>Fish &amp; chips &lt;3</description>
      <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
      <guid isPermaLink="false">post-1</guid>
      <dc:creator>Ada</dc:creator>
      <category>rust</category>
      <category>async</category>
    </item>
    <item>
      <title>Second</title>
      <link>https://example.com/posts/2</link>
      <author>bob@example.com (Bob)</author>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Atom</title>
  <entry>
    <title type="text">Atom &quot;one&quot;</title>
    <link rel="self" href="https://example.com/entries/1.xml"/>
    <link rel="alternate" type="text/html" href="https://example.com/entries/1"/>
    <id>urn:uuid:1</id>
    <updated>2025-01-06T10:00:00Z</updated>
    <summary>Short summary</summary>
    <author><name>Grace</name><email>grace@example.com</email></author>
    <category term="news"/>
    <category term="release" label="Release"/>
  </entry>
  <entry>
    <title>Atom two</title>
    <link href="https://example.com/entries/2"/>
    <id>urn:uuid:2</id>
    <published>2025-01-07T10:00:00Z</published>
    <updated>2025-01-08T10:00:00Z</updated>
    <content type="html">&lt;p&gt;Body&lt;/p&gt;</content>
  </entry>
</feed>"#;

    fn parse(xml: &str) -> Feed {
        FeedParser::new().unwrap().parse(xml).unwrap()
    }

    #[test]
    fn test_rss_items() {
        let feed = parse(RSS);
        assert_eq!(feed.format, FeedFormat::Rss);
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.title.as_deref(), Some("Rust & <Tokio>"));
        assert_eq!(first.link.as_deref(), Some("https://example.com/posts/1"));
        assert_eq!(first.description.as_deref(), Some("Fish & chips <3"));
        assert_eq!(first.pub_date.as_deref(), Some("Mon, 06 Jan 2025 10:00:00 GMT"));
        assert_eq!(first.guid.as_deref(), Some("post-1"));
        assert_eq!(first.author.as_deref(), Some("Ada"));
        assert_eq!(first.categories, vec!["rust", "async"]);

        let second = &feed.items[1];
        assert_eq!(second.author.as_deref(), Some("bob@example.com (Bob)"));
        assert_eq!(second.guid, None);
        assert_eq!(second.key(), Some("https://example.com/posts/2"));
    }

    #[test]
    fn test_atom_entries() {
        let feed = parse(ATOM);
        assert_eq!(feed.format, FeedFormat::Atom);
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.title.as_deref(), Some("Atom \"one\""));
        assert_eq!(first.link.as_deref(), Some("https://example.com/entries/1"));
        assert_eq!(first.guid.as_deref(), Some("urn:uuid:1"));
        assert_eq!(first.description.as_deref(), Some("Short summary"));
        assert_eq!(first.pub_date.as_deref(), Some("2025-01-06T10:00:00Z"));
        assert_eq!(first.author.as_deref(), Some("Grace"));
        assert_eq!(first.categories, vec!["news", "release"]);

        let second = &feed.items[1];
        assert_eq!(second.link.as_deref(), Some("https://example.com/entries/2"));
        assert_eq!(second.description.as_deref(), Some("<p>Body</p>"));
        assert_eq!(second.pub_date.as_deref(), Some("2025-01-07T10:00:00Z"));
        assert_eq!(second.author, None);
    }

    #[test]
    fn test_atom_link_falls_back_to_any_href() {
        let xml = r#"<feed><entry><id>x</id><link rel="related" href="https://r.example"/></entry></feed>"#;
        assert_eq!(parse(xml).items[0].link.as_deref(), Some("https://r.example"));
    }

    #[test]
    fn test_unknown_root_is_an_error() {
        let err = FeedParser::new().unwrap().parse("<html><body/></html>").unwrap_err();
        assert!(err.to_string().contains("html"));
    }

    #[test]
    fn test_key_precedence() {
        let mut item = FeedItem {
            title: Some("t".to_string()),
            ..FeedItem::default()
        };
        assert_eq!(item.key(), Some("t"));
        item.link = Some("l".to_string());
        assert_eq!(item.key(), Some("l"));
        item.guid = Some("g".to_string());
        assert_eq!(item.key(), Some("g"));
        assert_eq!(FeedItem::default().key(), None);
    }

    #[test]
    fn test_decode_entities_does_not_double_decode() {
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
        assert_eq!(decode_entities("it&#39;s &apos;ok&apos;"), "it's 'ok'");
    }

    #[test]
    fn test_to_data_shape() {
        let item = FeedItem {
            title: Some("t".to_string()),
            categories: vec!["c".to_string()],
            ..FeedItem::default()
        };
        let data = item.to_data("https://example.com/feed");
        assert_eq!(data["title"], "t");
        assert_eq!(data["link"], Value::Null);
        assert_eq!(data["categories"], json!(["c"]));
        assert_eq!(data["feedUrl"], "https://example.com/feed");
    }
}
