//! An ordered, immutable chain of stages applied to each document.

use std::collections::VecDeque;
use tracing::warn;

use crate::config::{PipelineConfig, StageKind};
use crate::document::Document;
use crate::error::{ConfigError, PipelineError, StageError};
use crate::stage::{FieldLength, SetStaticValues, Stage, StageCondition};

struct ConfiguredStage {
    stage: Box<dyn Stage>,
    conditions: Vec<StageCondition>,
}

impl ConfiguredStage {
    fn enabled_for(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| c.matches(doc))
    }
}

/// An ordered sequence of stages. Built once, then shared read-only by all
/// workers of a pipeline.
///
/// `process` applies the stages in declared order. Documents a stage emits
/// are collected and run through the *remaining* stages only; a stage never
/// reprocesses output it produced. The result is the input document after
/// all stages, followed by every emitted descendant.
pub struct Pipeline {
    name: String,
    stages: Vec<ConfiguredStage>,
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Build a pipeline of built-in stages from configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder(&config.name);
        for stage_config in &config.stages {
            let stage: Box<dyn Stage> = match &stage_config.kind {
                StageKind::SetStaticValues { fields, update_mode } => {
                    Box::new(SetStaticValues::new(fields.clone(), *update_mode))
                }
                StageKind::FieldLength { field_mapping } => {
                    Box::new(FieldLength::new(field_mapping.clone()))
                }
            };
            builder = builder.boxed_stage_when(stage, stage_config.conditions.clone());
        }
        Ok(builder.build())
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start every stage in order. A failure aborts the run.
    pub async fn start(&mut self) -> Result<(), StageError> {
        for configured in &mut self.stages {
            configured.stage.start().await?;
        }
        Ok(())
    }

    /// Stop every stage, logging failures.
    pub async fn stop(&mut self) {
        for configured in &mut self.stages {
            if let Err(e) = configured.stage.stop().await {
                warn!(stage = configured.stage.name(), "stage stop failed: {e}");
            }
        }
    }

    /// Run one document through the stage chain.
    pub async fn process(&self, doc: Document) -> Result<Vec<Document>, PipelineError> {
        let mut output = Vec::with_capacity(1);
        let mut work: VecDeque<(Document, usize)> = VecDeque::new();
        work.push_back((doc, 0));

        while let Some((mut current, first_stage)) = work.pop_front() {
            for index in first_stage..self.stages.len() {
                let configured = &self.stages[index];
                if !configured.enabled_for(&current) {
                    continue;
                }
                match configured.stage.process(&mut current).await {
                    Ok(None) => {}
                    Ok(Some(emitted)) => {
                        for doc in emitted {
                            work.push_back((doc, index + 1));
                        }
                    }
                    Err(source) => {
                        return Err(PipelineError {
                            stage: configured.stage.name().to_string(),
                            document_id: current.id().to_string(),
                            source,
                        });
                    }
                }
            }
            output.push(current);
        }

        Ok(output)
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    stages: Vec<ConfiguredStage>,
}

impl PipelineBuilder {
    /// Append an unconditional stage.
    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        self.boxed_stage_when(Box::new(stage), Vec::new())
    }

    /// Append a stage guarded by conditions; all must match for the stage
    /// to run on a given document.
    pub fn stage_when(self, stage: impl Stage + 'static, conditions: Vec<StageCondition>) -> Self {
        self.boxed_stage_when(Box::new(stage), conditions)
    }

    fn boxed_stage_when(
        mut self,
        stage: Box<dyn Stage>,
        conditions: Vec<StageCondition>,
    ) -> Self {
        self.stages.push(ConfiguredStage { stage, conditions });
        self
    }

    /// Finish the pipeline.
    pub fn build(self) -> Pipeline {
        Pipeline {
            name: self.name,
            stages: self.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Appends its tag to a `trail` field, recording visit order.
    struct TagStage {
        tag: &'static str,
    }

    #[async_trait]
    impl Stage for TagStage {
        fn name(&self) -> &str {
            self.tag
        }

        async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
            doc.set_or_add("trail", self.tag);
            Ok(None)
        }
    }

    /// Emits one child per value of `split`, then drops the field.
    struct SplitStage;

    #[async_trait]
    impl Stage for SplitStage {
        fn name(&self) -> &str {
            "split"
        }

        async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
            let Some(parts) = doc.get_string_list("split") else {
                return Ok(None);
            };
            doc.remove_field("split");
            let mut children = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                let mut child = Document::new(format!("{}-c{}", doc.id(), i + 1))
                    .map_err(|e| StageError::processing(e.to_string()))?;
                child.set_field("part", part.as_str());
                children.push(child);
            }
            Ok(Some(children))
        }
    }

    struct FailingStage;

    #[async_trait]
    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(&self, _doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
            Err(StageError::processing("synthetic failure"))
        }
    }

    #[tokio::test]
    async fn empty_pipeline_passes_document_through() {
        let pipeline = Pipeline::builder("p").build();
        let doc = Document::new("d1").unwrap();
        let results = pipeline.process(doc).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), "d1");
    }

    #[tokio::test]
    async fn stages_run_in_declared_order() {
        let pipeline = Pipeline::builder("p")
            .stage(TagStage { tag: "first" })
            .stage(TagStage { tag: "second" })
            .build();
        let results = pipeline.process(Document::new("d1").unwrap()).await.unwrap();
        assert_eq!(
            results[0].get_string_list("trail").unwrap(),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn emitted_documents_flow_through_remaining_stages_only() {
        let pipeline = Pipeline::builder("p")
            .stage(TagStage { tag: "before" })
            .stage(SplitStage)
            .stage(TagStage { tag: "after" })
            .build();

        let mut doc = Document::new("d1").unwrap();
        doc.add_to_field("split", "x");
        doc.add_to_field("split", "y");

        let results = pipeline.process(doc).await.unwrap();
        assert_eq!(results.len(), 3);

        // Input document first, after all stages.
        assert_eq!(results[0].id(), "d1");
        assert_eq!(
            results[0].get_string_list("trail").unwrap(),
            vec!["before", "after"]
        );

        // Children saw only the stages after the one that emitted them.
        assert_eq!(results[1].id(), "d1-c1");
        assert_eq!(results[1].get_string_list("trail").unwrap(), vec!["after"]);
        assert_eq!(results[2].id(), "d1-c2");
        assert_eq!(results[2].get_string("part").unwrap(), "y");
    }

    #[tokio::test]
    async fn condition_skips_stage_but_document_flows() {
        let condition = StageCondition::must("kind", vec!["article".to_string()]);
        let pipeline = Pipeline::builder("p")
            .stage_when(TagStage { tag: "guarded" }, vec![condition])
            .stage(TagStage { tag: "always" })
            .build();

        let results = pipeline.process(Document::new("d1").unwrap()).await.unwrap();
        assert_eq!(results[0].get_string_list("trail").unwrap(), vec!["always"]);

        let mut article = Document::new("d2").unwrap();
        article.set_field("kind", "article");
        let results = pipeline.process(article).await.unwrap();
        assert_eq!(
            results[0].get_string_list("trail").unwrap(),
            vec!["guarded", "always"]
        );
    }

    #[tokio::test]
    async fn stage_failure_aborts_the_document() {
        let pipeline = Pipeline::builder("p")
            .stage(TagStage { tag: "first" })
            .stage(FailingStage)
            .build();
        let err = pipeline
            .process(Document::new("bad").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.stage, "failing");
        assert_eq!(err.document_id, "bad");
        assert!(err.to_string().contains("synthetic failure"));
    }
}
