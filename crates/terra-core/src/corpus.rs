use serde::{Deserialize, Serialize};

/// Tag carried by story-advancing posts; scenes are built from runs of it.
pub const QM_POST_TAG: &str = "qm_post";

/// A thread from the read-only corpus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub title: Option<String>,
}

/// A single post from the corpus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoryPost {
    pub post_id: i64,
    pub thread_id: i64,
    pub body: String,
    pub author: Option<String>,
    /// ISO-8601 UTC, when the corpus recorded a timestamp.
    pub created_at: Option<String>,
    pub tags: Vec<String>,
}

impl StoryPost {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_qm_post(&self) -> bool {
        self.has_tag(QM_POST_TAG)
    }
}

/// A contiguous run of `qm_post`-tagged posts within one thread; the
/// runner's unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scene {
    pub thread_id: i64,
    /// Non-empty, ordered by post id.
    pub posts: Vec<StoryPost>,
    pub is_thread_start: bool,
    pub is_thread_end: bool,
    /// 0-based within the thread.
    pub scene_index: i64,
}

impl Scene {
    pub fn first_post_id(&self) -> i64 {
        self.posts.first().map(|p| p.post_id).unwrap_or(0)
    }

    pub fn last_post_id(&self) -> i64 {
        self.posts.last().map(|p| p.post_id).unwrap_or(0)
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    /// Post bodies joined for keyword extraction and message building.
    pub fn combined_text(&self) -> String {
        self.posts
            .iter()
            .map(|p| p.body.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: i64, tags: &[&str]) -> StoryPost {
        StoryPost {
            post_id: id,
            thread_id: 1,
            body: format!("post {id}"),
            author: None,
            created_at: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn has_tag_matches_exactly() {
        let p = post(1, &["qm_post", "op_post"]);
        assert!(p.is_qm_post());
        assert!(p.has_tag("op_post"));
        assert!(!p.has_tag("story_post"));
    }

    #[test]
    fn scene_post_ids() {
        let scene = Scene {
            thread_id: 1,
            posts: vec![post(10, &["qm_post"]), post(12, &["qm_post"])],
            is_thread_start: true,
            is_thread_end: false,
            scene_index: 0,
        };
        assert_eq!(scene.first_post_id(), 10);
        assert_eq!(scene.last_post_id(), 12);
        assert_eq!(scene.post_count(), 2);
        assert!(scene.combined_text().contains("post 10"));
    }
}
