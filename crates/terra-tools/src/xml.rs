//! XML rendering for tool responses.

use terra_core::corpus::StoryPost;
use terra_core::entry::GlossaryEntry;

/// Escape text for element content and attribute values.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `<tool_error name="NAME">reason</tool_error>`
pub fn tool_error(name: &str, reason: &str) -> String {
    format!("<tool_error name=\"{}\">{}</tool_error>", escape(name), escape(reason))
}

pub fn format_entry(entry: &GlossaryEntry) -> String {
    format_entry_as(entry, "entry")
}

pub fn format_entry_as(entry: &GlossaryEntry, tag: &str) -> String {
    let tags_attr = if entry.tags.is_empty() {
        String::new()
    } else {
        format!(" tags=\"{}\"", escape(&entry.tags.join(",")))
    };
    format!(
        "<{tag} id=\"{}\" term=\"{}\" status=\"{}\"{tags_attr}>{}</{tag}>",
        entry.id,
        escape(&entry.term),
        entry.status,
        escape(&entry.definition),
    )
}

pub fn format_post(post: &StoryPost) -> String {
    format_post_as(post, "corpus_post")
}

pub fn format_post_as(post: &StoryPost, tag: &str) -> String {
    let mut attrs = vec![
        format!("id=\"{}\"", post.post_id),
        format!("thread_id=\"{}\"", post.thread_id),
    ];
    if let Some(author) = &post.author {
        attrs.push(format!("author=\"{}\"", escape(author)));
    }
    if let Some(ts) = &post.created_at {
        attrs.push(format!("ts=\"{}\"", escape(ts)));
    }
    if !post.tags.is_empty() {
        attrs.push(format!("tags=\"{}\"", escape(&post.tags.join(","))));
    }
    format!(
        "<{tag} {}>{}</{tag}>",
        attrs.join(" "),
        escape(post.body.trim()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_core::entry::EntryStatus;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("a<b> & \"c\""), "a&lt;b&gt; &amp; &quot;c&quot;");
    }

    #[test]
    fn tool_error_shape() {
        let xml = tool_error("glossary_create", "DuplicateTerm: term 'Soma' already exists (id=1)");
        assert!(xml.starts_with("<tool_error name=\"glossary_create\">"));
        assert!(xml.contains("DuplicateTerm"));
        assert!(xml.ends_with("</tool_error>"));
    }

    #[test]
    fn entry_rendering() {
        let entry = GlossaryEntry {
            id: 3,
            term: "Soma".into(),
            term_normalized: "soma".into(),
            definition: "Questmaster <NPC>".into(),
            status: EntryStatus::Tentative,
            tags: vec!["character".into()],
            first_seen_post_id: 100,
            first_seen_thread_id: 1,
            last_updated_post_id: 100,
            last_updated_thread_id: 1,
            created_at: "t".into(),
            updated_at: "t".into(),
        };
        let xml = format_entry(&entry);
        assert!(xml.contains("id=\"3\""));
        assert!(xml.contains("status=\"tentative\""));
        assert!(xml.contains("tags=\"character\""));
        assert!(xml.contains("&lt;NPC&gt;"));
    }

    #[test]
    fn post_rendering_skips_absent_fields() {
        let post = StoryPost {
            post_id: 100,
            thread_id: 1,
            body: "  body text  ".into(),
            author: None,
            created_at: None,
            tags: vec![],
        };
        let xml = format_post(&post);
        assert_eq!(xml, "<corpus_post id=\"100\" thread_id=\"1\">body text</corpus_post>");
    }
}
