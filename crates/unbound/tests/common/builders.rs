//! Builders and processor doubles.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use unbound::queue::ProcessingJob;
use unbound::{ChapterNode, NewDocument, ProcessingOutput};
use unbound::worker::JobProcessor;

/// Builds a chapter tree fluently.
pub struct ChapterBuilder {
    node: ChapterNode,
}

impl ChapterBuilder {
    pub fn new(title: &str, slug: &str) -> Self {
        Self {
            node: ChapterNode::new(title, slug),
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.node = self.node.with_page_start(page);
        self
    }

    pub fn child(mut self, child: ChapterBuilder) -> Self {
        self.node.children.push(child.build());
        self
    }

    pub fn build(self) -> ChapterNode {
        self.node
    }
}

pub fn bio_101() -> NewDocument {
    NewDocument::new("student-1", "Bio 101", "file://bio101.pdf")
}

pub fn one_chapter() -> Vec<ChapterNode> {
    vec![ChapterBuilder::new("Ch1", "ch1").build()]
}

/// Replays scripted results in order, then succeeds with `one_chapter()`.
#[derive(Default)]
pub struct ScriptedProcessor {
    script: Mutex<VecDeque<Result<ProcessingOutput, String>>>,
    calls: Mutex<Vec<ProcessingJob>>,
}

impl ScriptedProcessor {
    pub fn new(script: Vec<Result<ProcessingOutput, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(times: usize, reason: &str) -> Self {
        Self::new((0..times).map(|_| Err(reason.to_string())).collect())
    }

    pub fn calls(&self) -> Vec<ProcessingJob> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    async fn process(&self, job: &ProcessingJob) -> Result<ProcessingOutput, String> {
        self.calls.lock().unwrap().push(job.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ProcessingOutput {
                    structure: one_chapter(),
                    page_count: 42,
                })
            })
    }
}
