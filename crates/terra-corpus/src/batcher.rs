use std::collections::VecDeque;
use std::sync::Arc;

use tracing::instrument;

use terra_core::corpus::{Scene, StoryPost};

use crate::reader::{CorpusError, CorpusReader};

const DEFAULT_PAGE_SIZE: usize = 256;

/// What the batcher hands the runner: a scene, or a boundary marker for a
/// thread that produced no scenes at all (the runner still needs the
/// boundary event).
#[derive(Clone, Debug)]
pub enum SceneEvent {
    Scene(Scene),
    ThreadBoundary { thread_id: i64 },
}

/// Groups corpus posts into scenes: maximal runs of consecutive
/// `qm_post`-tagged posts within one thread.
///
/// A finished scene is held back until the batcher sees either another
/// qm run in the same thread or a thread boundary, so `is_thread_end` is
/// correct even when a thread trails off in untagged posts.
pub struct SceneBatcher {
    reader: Arc<CorpusReader>,
    page_size: usize,

    cursor: Option<(i64, i64)>,
    page: VecDeque<StoryPost>,
    exhausted: bool,

    current_thread: Option<i64>,
    scene_index: i64,
    run: Vec<StoryPost>,
    pending: Option<Scene>,
    queued: VecDeque<SceneEvent>,
    done: bool,
}

impl SceneBatcher {
    pub fn new(reader: Arc<CorpusReader>) -> Self {
        Self::with_page_size(reader, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(reader: Arc<CorpusReader>, page_size: usize) -> Self {
        Self {
            reader,
            page_size: page_size.max(1),
            cursor: None,
            page: VecDeque::new(),
            exhausted: false,
            current_thread: None,
            scene_index: 0,
            run: Vec::new(),
            pending: None,
            queued: VecDeque::new(),
            done: false,
        }
    }

    /// Resume after an already-processed post.
    #[instrument(skip(self))]
    pub fn start_after(mut self, post_id: i64) -> Result<Self, CorpusError> {
        self.cursor = self.reader.cursor_for_post(post_id)?;
        Ok(self)
    }

    fn next_post(&mut self) -> Result<Option<StoryPost>, CorpusError> {
        if let Some(post) = self.page.pop_front() {
            return Ok(Some(post));
        }
        if self.exhausted {
            return Ok(None);
        }
        let posts = self.reader.next_page(self.cursor, self.page_size)?;
        match posts.last() {
            Some(last) => self.cursor = Some((last.thread_id, last.post_id)),
            None => {
                self.exhausted = true;
                return Ok(None);
            }
        }
        self.page = posts.into();
        Ok(self.page.pop_front())
    }

    fn close_run(&mut self) {
        if self.run.is_empty() {
            return;
        }
        let posts = std::mem::take(&mut self.run);
        let scene = Scene {
            thread_id: posts[0].thread_id,
            is_thread_start: self.scene_index == 0,
            is_thread_end: false, // decided when the pending scene flushes
            scene_index: self.scene_index,
            posts,
        };
        self.scene_index += 1;
        debug_assert!(self.pending.is_none());
        self.pending = Some(scene);
    }

    fn flush_pending(&mut self, is_thread_end: bool) {
        if let Some(mut scene) = self.pending.take() {
            scene.is_thread_end = is_thread_end;
            self.queued.push_back(SceneEvent::Scene(scene));
        }
    }

    /// Close out the current thread at a boundary (thread change or corpus
    /// exhaustion).
    fn close_thread(&mut self) {
        let thread_id = match self.current_thread {
            Some(id) => id,
            None => return,
        };
        let had_scenes = self.scene_index > 0 || !self.run.is_empty();

        if !self.run.is_empty() {
            self.flush_pending(false);
            self.close_run();
        }
        self.flush_pending(true);

        if !had_scenes {
            self.queued.push_back(SceneEvent::ThreadBoundary { thread_id });
        }
        self.scene_index = 0;
    }

    fn step(&mut self, post: StoryPost) {
        if self.current_thread != Some(post.thread_id) {
            if self.current_thread.is_some() {
                self.close_thread();
            }
            self.current_thread = Some(post.thread_id);
        }

        if post.is_qm_post() {
            if self.run.is_empty() {
                // A new run in the same thread proves the held scene was
                // not the thread's last.
                self.flush_pending(false);
            }
            self.run.push(post);
        } else if !self.run.is_empty() {
            self.close_run();
        }
        // Untagged posts outside a run are skipped silently.
    }
}

impl Iterator for SceneBatcher {
    type Item = Result<SceneEvent, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            match self.next_post() {
                Ok(Some(post)) => self.step(post),
                Ok(None) => {
                    self.close_thread();
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::fixtures::{create_corpus, insert_post};

    fn scenes_of(events: &[SceneEvent]) -> Vec<&Scene> {
        events
            .iter()
            .filter_map(|e| match e {
                SceneEvent::Scene(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn collect(reader: CorpusReader) -> Vec<SceneEvent> {
        SceneBatcher::with_page_size(Arc::new(reader), 2)
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn partitions_qm_runs_into_scenes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "scene a1", &["qm_post"]);
        insert_post(&conn, 1, 101, "scene a2", &["qm_post"]);
        insert_post(&conn, 1, 102, "reader chatter", &[]);
        insert_post(&conn, 1, 103, "scene b1", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        let scenes = scenes_of(&events);
        assert_eq!(scenes.len(), 2);

        assert_eq!(scenes[0].scene_index, 0);
        assert!(scenes[0].is_thread_start);
        assert!(!scenes[0].is_thread_end);
        assert_eq!(scenes[0].posts.len(), 2);

        assert_eq!(scenes[1].scene_index, 1);
        assert!(!scenes[1].is_thread_start);
        assert!(scenes[1].is_thread_end);
    }

    #[test]
    fn every_qm_post_lands_in_exactly_one_scene() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        let mut qm_ids = Vec::new();
        for i in 0..20i64 {
            let id = 100 + i;
            if i % 3 == 0 {
                insert_post(&conn, 1 + i / 10, id, "chatter", &[]);
            } else {
                insert_post(&conn, 1 + i / 10, id, "story", &["qm_post"]);
                qm_ids.push(id);
            }
        }
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        let mut seen = Vec::new();
        for scene in scenes_of(&events) {
            assert!(!scene.posts.is_empty());
            assert!(scene.posts.iter().all(|p| p.thread_id == scene.thread_id));
            seen.extend(scene.posts.iter().map(|p| p.post_id));
        }
        seen.sort_unstable();
        assert_eq!(seen, qm_ids, "scene partition must cover qm posts exactly once");
    }

    #[test]
    fn thread_end_set_despite_trailing_chatter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "story", &["qm_post"]);
        insert_post(&conn, 1, 101, "chatter", &[]);
        insert_post(&conn, 1, 102, "more chatter", &[]);
        insert_post(&conn, 2, 200, "next thread", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        let scenes = scenes_of(&events);
        assert_eq!(scenes.len(), 2);
        assert!(scenes[0].is_thread_end, "last scene of thread 1 ends the thread");
        assert_eq!(scenes[1].thread_id, 2);
        assert!(scenes[1].is_thread_end, "corpus exhaustion ends the thread");
    }

    #[test]
    fn scene_index_resets_per_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "a", &["qm_post"]);
        insert_post(&conn, 1, 101, "x", &[]);
        insert_post(&conn, 1, 102, "b", &["qm_post"]);
        insert_post(&conn, 2, 200, "c", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        let scenes = scenes_of(&events);
        assert_eq!(scenes[0].scene_index, 0);
        assert_eq!(scenes[1].scene_index, 1);
        assert_eq!(scenes[2].scene_index, 0);
        assert!(scenes[2].is_thread_start);
    }

    #[test]
    fn sceneless_thread_emits_boundary_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "only chatter", &[]);
        insert_post(&conn, 2, 200, "story", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        assert!(matches!(
            events[0],
            SceneEvent::ThreadBoundary { thread_id: 1 }
        ));
        assert!(matches!(&events[1], SceneEvent::Scene(s) if s.thread_id == 2));
    }

    #[test]
    fn leading_chatter_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "preamble", &[]);
        insert_post(&conn, 1, 101, "story", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events = collect(reader);
        let scenes = scenes_of(&events);
        assert_eq!(scenes.len(), 1);
        assert!(scenes[0].is_thread_start);
        assert_eq!(scenes[0].first_post_id(), 101);
    }

    #[test]
    fn empty_corpus_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        drop(create_corpus(&path));
        let reader = CorpusReader::open(&path).unwrap();
        assert!(collect(reader).is_empty());
    }

    #[test]
    fn start_after_resumes_mid_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let conn = create_corpus(&path);
        insert_post(&conn, 1, 100, "a", &["qm_post"]);
        insert_post(&conn, 1, 101, "x", &[]);
        insert_post(&conn, 1, 102, "b", &["qm_post"]);
        insert_post(&conn, 2, 200, "c", &["qm_post"]);
        drop(conn);
        let reader = CorpusReader::open(&path).unwrap();

        let events: Vec<SceneEvent> = SceneBatcher::new(Arc::new(reader))
            .start_after(101)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        let scenes = scenes_of(&events);
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].first_post_id(), 102);
        assert_eq!(scenes[1].first_post_id(), 200);
    }
}
