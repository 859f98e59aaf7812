//! Confidence-gated dataset filter.
//!
//! Pipeline flow:
//! Rows → Prompt (+ Image) → Processor → Classifier → Results → Filtered table
//!
//! Epistemic foundation:
//! - K_i: Exactly one decision per row, appended in dataset order
//! - K_i: Every caller contract is checked before the first forward pass
//! - B_i: An image may be missing or undecodable → recorded with the
//!   configured default, never propagated
//! - I^B: Provider failure aborts the run; the last checkpoint stays on disk

use crate::checkpoint::{CheckpointManager, CheckpointState, RunSignature};
use crate::classifier::{ConfidenceClassifier, Readiness};
use crate::models::{
    Config, ConfigError, Dataset, PromptTemplate, Result, RunStats, Sample, SieveError,
};
use crate::provider::{AnswerTokens, LanguageModel, Processor};
use image::{DynamicImage, ImageError, ImageReader};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Settings fixed for the lifetime of a pipeline.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Prompt template rendered per row
    pub prompt: PromptTemplate,
    /// Column substituted for `{caption}`
    pub caption_column: Option<String>,
    /// Column holding the image path; selects vision mode
    pub image_column: Option<String>,
    /// Directory relative image paths are joined onto
    pub image_root: Option<PathBuf>,
    /// Confidence threshold in (0, 1)
    pub threshold: f64,
    /// Readiness gate
    pub readiness: Readiness,
    /// Decision recorded for missing or corrupted images
    pub keep_on_corrupted: bool,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl FilterSettings {
    /// Text-mode settings with default threshold and readiness.
    pub fn text(prompt: PromptTemplate, caption_column: Option<String>) -> Self {
        Self {
            prompt,
            caption_column,
            image_column: None,
            image_root: None,
            threshold: 0.5,
            readiness: Readiness::default(),
            keep_on_corrupted: false,
            show_progress: true,
        }
    }

    /// Build settings from a loaded configuration.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            prompt: PromptTemplate::parse(&config.filter.prompt)?,
            caption_column: config.dataset.caption_column.clone(),
            image_column: config.dataset.image_column.clone(),
            image_root: config.dataset.image_root.clone(),
            threshold: config.filter.threshold,
            readiness: Readiness {
                early_stop: config.filter.early_stop,
                max_attempts: config.filter.max_attempts,
                top_k: config.filter.top_k,
            },
            keep_on_corrupted: config.filter.keep_on_corrupted,
            show_progress: true,
        })
    }

    /// Whether rows carry an image.
    pub fn is_vision(&self) -> bool {
        self.image_column.is_some()
    }

    fn resolve_image_path(&self, field: &str) -> PathBuf {
        match &self.image_root {
            Some(root) => root.join(field),
            None => PathBuf::from(field),
        }
    }
}

/// Result of a filtering run.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Decisions and counters, aligned with the dataset rows
    pub state: CheckpointState,
    /// Summary of the run
    pub stats: RunStats,
}

impl FilterOutcome {
    /// One keep/discard decision per dataset row.
    pub fn results(&self) -> &[bool] {
        &self.state.results
    }

    /// Rows whose image was missing or corrupted.
    pub fn corrupted(&self) -> usize {
        self.state.corrupted
    }
}

/// Why an image could not be used.
#[derive(Debug, thiserror::Error)]
enum ImageFailure {
    #[error("image is missing or unreadable: {0}")]
    Missing(#[source] std::io::Error),

    #[error("image is corrupted: {0}")]
    Corrupted(#[source] ImageError),
}

/// Open and decode an image, telling unreadable files from undecodable ones.
fn load_image(path: &Path) -> std::result::Result<DynamicImage, ImageFailure> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(ImageFailure::Missing)?;

    reader.decode().map_err(|e| match e {
        ImageError::IoError(io) => ImageFailure::Missing(io),
        other => ImageFailure::Corrupted(other),
    })
}

/// Column indices and classifier resolved before the first row.
struct RunPlan {
    caption: Option<usize>,
    image: Option<usize>,
    classifier: ConfidenceClassifier,
    signature: RunSignature,
}

/// Dataset filter driving a model and processor over every row.
pub struct FilterPipeline<M, P> {
    settings: FilterSettings,
    model: M,
    processor: P,
}

impl<M: LanguageModel, P: Processor> FilterPipeline<M, P> {
    /// Create a new filter pipeline.
    pub fn new(settings: FilterSettings, model: M, processor: P) -> Self {
        Self {
            settings,
            model,
            processor,
        }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    /// Give back the model and processor.
    pub fn into_parts(self) -> (M, P) {
        (self.model, self.processor)
    }

    /// Resolve columns, answer tokens and the classifier.
    ///
    /// B_i(caller contracts hold) → Result, before any forward pass
    fn plan(&self, dataset: &Dataset) -> Result<RunPlan> {
        let settings = &self.settings;
        if settings.prompt.uses_caption() && settings.caption_column.is_none() {
            return Err(ConfigError::CaptionWithoutColumn.into());
        }

        let caption = settings
            .caption_column
            .as_deref()
            .map(|c| dataset.column_index(c))
            .transpose()?;
        let image = settings
            .image_column
            .as_deref()
            .map(|c| dataset.column_index(c))
            .transpose()?;

        let answers = AnswerTokens::resolve(&self.processor)?;
        let classifier = ConfidenceClassifier::new(settings.threshold, answers, settings.readiness)?;

        debug!(
            yes = answers.yes,
            no = answers.no,
            required_logit_diff = classifier.required_logit_diff(),
            "Classifier ready"
        );

        let signature = RunSignature {
            prompt: settings.prompt.source().to_string(),
            threshold: settings.threshold,
            readiness: settings.readiness,
            answers,
            keep_on_corrupted: settings.keep_on_corrupted,
        };

        Ok(RunPlan {
            caption,
            image,
            classifier,
            signature,
        })
    }

    /// Run the filter over every row of `dataset`.
    ///
    /// With a checkpoint manager, the kept rows are flushed to its output
    /// every `checkpoint_every` rows and a resumable state is recorded. The
    /// final write is left to the caller.
    pub fn run(
        &mut self,
        dataset: &Dataset,
        mut checkpoint: Option<&mut CheckpointManager>,
    ) -> Result<FilterOutcome> {
        let start = Instant::now();
        let plan = self.plan(dataset)?;

        let mut state = match checkpoint.as_deref_mut() {
            Some(mgr) => mgr.init_or_load(dataset, &plan.signature)?,
            None => CheckpointState::new(dataset, plan.signature.clone()),
        };
        let resumed = state.processed();

        info!(
            rows = dataset.len(),
            resumed,
            vision = self.settings.is_vision(),
            threshold = self.settings.threshold,
            early_stop = self.settings.readiness.early_stop,
            max_attempts = self.settings.readiness.max_attempts,
            "Starting filter"
        );

        let pb = self.progress_bar(dataset.len())?;
        pb.set_position(resumed as u64);

        for sample in dataset.samples().skip(resumed) {
            if let Some(mgr) = checkpoint.as_deref_mut() {
                if mgr.is_due() {
                    let kept = mgr.save(dataset, &state)?;
                    info!(
                        processed = state.processed(),
                        kept,
                        path = %mgr.output_path().display(),
                        "Checkpoint written"
                    );
                }
                mgr.record_row();
            }

            self.process_row(&plan, &sample, &mut state)?;

            pb.inc(1);
            pb.set_message(format!(
                "kept: {}, discarded: {}, corrupted: {}",
                state.kept(),
                state.processed() - state.kept(),
                state.corrupted
            ));
        }

        if state.results.len() != dataset.len() {
            return Err(SieveError::Internal(format!(
                "{} decisions for {} rows",
                state.results.len(),
                dataset.len()
            )));
        }

        pb.finish_with_message(format!(
            "Done! {} kept, {} discarded",
            state.kept(),
            state.processed() - state.kept()
        ));

        let mut stats = state.to_run_stats(resumed, start.elapsed().as_secs_f64());
        stats.checkpoints_written = checkpoint.as_ref().map_or(0, |mgr| mgr.writes());

        info!(
            kept = stats.kept,
            discarded = stats.discarded,
            corrupted = stats.corrupted,
            exhausted = stats.exhausted,
            keep_rate = format!("{:.1}%", stats.keep_rate * 100.0),
            "Filter complete"
        );

        Ok(FilterOutcome { state, stats })
    }

    /// Decide one row and record the result.
    fn process_row(
        &mut self,
        plan: &RunPlan,
        sample: &Sample<'_>,
        state: &mut CheckpointState,
    ) -> Result<()> {
        let caption = plan.caption.map(|c| sample.field(c)).transpose()?;
        let prompt = self.settings.prompt.render(caption);

        let image = match plan.image {
            Some(column) => {
                let path = self.settings.resolve_image_path(sample.field(column)?);
                match load_image(&path) {
                    Ok(image) => Some(image),
                    Err(failure) => {
                        warn!(
                            row = sample.index,
                            path = %path.display(),
                            error = %failure,
                            keep = self.settings.keep_on_corrupted,
                            "Skipping row with unusable image"
                        );
                        state.record_corrupted(self.settings.keep_on_corrupted);
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        let input = self.processor.encode(&prompt, image.as_ref())?;
        let decision = plan.classifier.classify(&mut self.model, input)?;

        if decision.is_attempt_limit() {
            state.record_exhausted();
        } else {
            state.record(decision.keep());
        }

        debug!(
            row = sample.index,
            keep = decision.keep(),
            forward_passes = decision.forward_passes(),
            "Row classified"
        );
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.settings.show_progress {
            return Ok(ProgressBar::hidden());
        }

        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .map_err(|e| SieveError::Internal(format!("Invalid progress template: {e}")))?
            .progress_chars("##-");
        Ok(ProgressBar::new(len as u64).with_style(style))
    }
}
