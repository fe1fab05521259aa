//! DialogEngine – the only component that mutates sessions.
//!
//! Every call follows the same _lock → load → transition → save → notify_
//! pattern. The per-owner lock is held for the whole call, so two events from
//! one owner (a duplicate tap, say) are handled strictly one after the other,
//! while events from different owners never wait on each other.
//!
//! ```rust,ignore
//! let engine = DialogEngine::new(schemas, sessions, collaborators, EngineConfig::default());
//! engine.start(owner, "contest_participation", StartMode::Reject).await?;
//! engine.handle_event(Event::selection(owner, "olympiad-x")).await?;
//! ```
//!
//! Failures keep the stored session exactly as it was before the event:
//! validation errors re-issue the current prompt, upstream failures ask the
//! user to retry later, and a broken schema aborts the conversation.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{CatalogOption, CatalogProvider},
    error::{FormError, Result},
    event::{Event, EventKind, OwnerId, Prompt},
    fields::Fields,
    files::FileIntake,
    machine::{self, FileCarryOver, Moved},
    notify::NotificationSink,
    phase::{Answer, ChoiceSource, InputKind, PhaseDef, Transition},
    records::{RecordCommitter, RecordStore},
    render,
    retry::RetryPolicy,
    schema::{FormSchema, SchemaRegistry},
    session::{Session, SessionStore},
};

/// Command that cancels the active form from any phase
pub const CANCEL_COMMAND: &str = "cancel";

const CANCELLED_TEXT: &str = "Заполнение формы отменено. Введённые данные удалены.";
const TRY_LATER_TEXT: &str =
    "Сервис временно недоступен, попробуйте позже. Введённые данные сохранены.";
const ABORTED_TEXT: &str =
    "Произошла внутренняя ошибка, заполнение формы прервано. Начните заново командой /start.";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub file_carry_over: FileCarryOver,
    /// Sessions idle longer than this are dropped; `None` keeps them forever
    pub session_ttl: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            file_carry_over: FileCarryOver::StartEmpty,
            session_ttl: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// What `start` does when the owner already has an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    #[default]
    Reject,
    Replace,
}

/// External services the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogProvider>,
    pub files: Arc<dyn FileIntake>,
    pub records: Arc<dyn RecordStore>,
    pub sink: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DialogStatus {
    /// Waiting for the owner's answer to `phase`
    WaitingForInput { phase: String },
    /// Every record was written and the session is gone
    Completed { written: usize },
    /// Only some records were written; the session is gone regardless
    PartiallyCommitted { written: usize, total: usize },
    Cancelled,
}

/// Outcome of one engine call: the prompt already sent to the owner and where the dialog stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineResult {
    pub prompt: Prompt,
    #[serde(flatten)]
    pub status: DialogStatus,
}

#[derive(Clone)]
pub struct DialogEngine {
    schemas: Arc<SchemaRegistry>,
    sessions: Arc<dyn SessionStore>,
    collaborators: Collaborators,
    committer: RecordCommitter,
    config: EngineConfig,
}

impl DialogEngine {
    pub fn new(
        schemas: Arc<SchemaRegistry>,
        sessions: Arc<dyn SessionStore>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let committer = RecordCommitter::new(collaborators.records.clone(), config.retry.clone());
        Self {
            schemas,
            sessions,
            collaborators,
            committer,
            config,
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a new session at the schema's entry phase and sends its prompt.
    ///
    /// Fails with [`FormError::Conflict`] when a live session exists and `mode`
    /// is [`StartMode::Reject`].
    pub async fn start(&self, owner: OwnerId, schema_id: &str, mode: StartMode) -> Result<EngineResult> {
        let schema = self.schemas.get(schema_id)?;
        let guard = self.sessions.lock(owner).await;
        let result = self.start_locked(owner, &schema, mode).await;
        drop(guard);
        if closes_session(&result) || matches!(&result, Err(e) if e.is_transient()) {
            self.sessions.release(owner);
        }
        result
    }

    async fn start_locked(&self, owner: OwnerId, schema: &FormSchema, mode: StartMode) -> Result<EngineResult> {
        let mut session = Session::new(owner, schema.id.clone(), "");
        if let Some(existing) = self.live_session(owner).await? {
            if mode == StartMode::Reject {
                warn!(
                    owner_id = %owner,
                    schema = %schema.id,
                    active = %existing.schema_id,
                    "Start rejected, form already in progress"
                );
                return Err(FormError::Conflict(owner));
            }
            info!(owner_id = %owner, replaced = %existing.schema_id, "Replacing active form session");
            session.version = existing.version;
        }

        let moved = match machine::enter_entry(schema, &mut session) {
            Ok(moved) => moved,
            Err(e) => return self.abort(&session, e).await,
        };
        info!(owner_id = %owner, schema = %schema.id, "Form session started");
        let result = self.advance(schema, session, moved).await;
        if matches!(&result, Err(e) if e.is_transient()) {
            // the entry prompt never reached the owner, so a new start must not conflict
            if let Err(e) = self.sessions.delete(owner).await {
                warn!(owner_id = %owner, error = %e, "Could not drop unannounced session");
            }
        }
        result
    }

    /// Applies one owner event to the active session.
    ///
    /// Returns [`FormError::NoActiveSession`] when there is nothing to apply it
    /// to; transports should ignore that case. A [`FormError::Validation`] has
    /// already been reported to the owner together with the current prompt.
    pub async fn handle_event(&self, event: Event) -> Result<EngineResult> {
        let owner = event.owner_id;
        if event.command_name() == Some(CANCEL_COMMAND) {
            return match self.cancel(owner).await? {
                true => Ok(EngineResult {
                    prompt: Prompt::text(CANCELLED_TEXT),
                    status: DialogStatus::Cancelled,
                }),
                false => Err(FormError::NoActiveSession(owner)),
            };
        }

        let guard = self.sessions.lock(owner).await;
        let result = self.handle_locked(event).await;
        drop(guard);
        if closes_session(&result) {
            self.sessions.release(owner);
        }
        result
    }

    async fn handle_locked(&self, event: Event) -> Result<EngineResult> {
        let owner = event.owner_id;
        let Some(session) = self.live_session(owner).await? else {
            debug!(owner_id = %owner, "Event without an active form session");
            return Err(FormError::NoActiveSession(owner));
        };
        let schema = match self.schemas.get(&session.schema_id) {
            Ok(schema) => schema,
            Err(e) => return self.abort(&session, FormError::schema(e.to_string())).await,
        };

        let at_terminal = match schema.phase(&session.phase) {
            Ok(phase) => phase.is_terminal(),
            Err(e) => return self.abort(&session, e).await,
        };
        if at_terminal {
            // an earlier commit wrote nothing; any event retries it
            return self.finish(&schema, session).await;
        }

        let mut working = session.clone();
        match self.apply(&schema, &mut working, &event).await {
            Ok(moved) => self.advance(&schema, working, moved).await,
            Err(FormError::Validation(reason)) => self.reject(&schema, &session, reason).await,
            Err(e) => self.fail(&session, e).await,
        }
    }

    /// Drops the owner's session if there is one.
    ///
    /// Idempotent. The acknowledgment is only sent when a session was actually
    /// removed; the return value says whether that happened.
    pub async fn cancel(&self, owner: OwnerId) -> Result<bool> {
        let guard = self.sessions.lock(owner).await;
        let existed = self
            .sessions
            .get(owner)
            .await?
            .is_some_and(|s| !s.committed);
        self.sessions.delete(owner).await?;
        drop(guard);
        self.sessions.release(owner);
        if existed {
            info!(owner_id = %owner, "Form session cancelled");
            self.deliver(owner, &Prompt::text(CANCELLED_TEXT)).await;
        }
        Ok(existed)
    }

    /// Current session of `owner`, if any and not expired
    pub async fn session(&self, owner: OwnerId) -> Result<Option<Session>> {
        let session = self.sessions.get(owner).await?;
        Ok(session.filter(|s| !s.committed && !self.is_expired(s)))
    }

    /// Removes sessions idle past the configured TTL
    pub async fn purge_idle(&self) -> Result<usize> {
        let Some(cutoff) = self.idle_cutoff() else {
            return Ok(0);
        };
        let purged = self.sessions.purge_idle(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged idle form sessions");
        }
        Ok(purged)
    }

    async fn apply(&self, schema: &FormSchema, session: &mut Session, event: &Event) -> Result<Moved> {
        let phase = schema.phase(&session.phase)?.clone();
        let carry_over = self.config.file_carry_over;

        // terminators win over reading the command as item data
        if let Some(command) = event.command_name() {
            if phase.repeat_terminator() == Some(command) {
                return machine::finish_repeat(schema, session, carry_over);
            }
            if let Some(group_id) = session.active_group.clone() {
                if schema.group(&group_id)?.terminator == command {
                    return machine::close_group(schema, session);
                }
            }
            if let InputKind::Command(expected) = &phase.input {
                if expected == command {
                    return machine::accept(schema, session, &Answer::value(command), carry_over);
                }
            }
            return Err(FormError::validation(format!(
                "Команда /{command} сейчас недоступна."
            )));
        }

        let answer = self.resolve(&phase, session, &event.kind).await?;
        machine::accept(schema, session, &answer, carry_over)
    }

    /// Checks the event against the phase's input kind and normalises it into an answer
    async fn resolve(&self, phase: &PhaseDef, session: &Session, kind: &EventKind) -> Result<Answer> {
        let view = session.visible_fields();
        let answer = match (&phase.input, kind) {
            (InputKind::FreeText, EventKind::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(FormError::validation("Ответ не может быть пустым."));
                }
                Answer::value(text)
            }
            (InputKind::SingleChoice(source), EventKind::Selection(picked) | EventKind::Text(picked)) => {
                let picked = picked.trim();
                let option = self
                    .options(source, &view)
                    .await?
                    .into_iter()
                    .find(|o| o.id == picked || o.label == picked)
                    .ok_or_else(|| FormError::validation("Пожалуйста, выберите вариант из списка."))?;
                Answer {
                    value: Value::String(option.label.clone()),
                    option: Some(option),
                }
            }
            (InputKind::File { allowed_extensions }, EventKind::File(upload)) => {
                let intake = self
                    .config
                    .retry
                    .run("file_intake", || self.collaborators.files.intake(upload, allowed_extensions))
                    .await;
                let file_ref = match intake {
                    Err(FormError::UnsupportedFormat(detail)) => {
                        return Err(FormError::validation(format!(
                            "Неподдерживаемый формат файла: {detail}"
                        )));
                    }
                    other => other?,
                };
                Answer::value(serde_json::to_value(&file_ref)?)
            }
            (InputKind::Command(expected), _) => {
                return Err(FormError::validation(format!(
                    "Отправьте /{expected}, чтобы продолжить."
                )));
            }
            (input, _) => {
                return Err(FormError::validation(format!("Ожидается {}.", input.describe())));
            }
        };

        let value = phase
            .check(answer.value, &view)
            .map_err(FormError::Validation)?;
        Ok(Answer {
            value,
            option: answer.option,
        })
    }

    async fn options(&self, source: &ChoiceSource, fields: &Fields) -> Result<Vec<CatalogOption>> {
        let mut options = match source.catalog_name(fields) {
            Some(name) => {
                self.config
                    .retry
                    .run("list_options", || self.collaborators.catalog.list_options(&name))
                    .await?
            }
            None => Vec::new(),
        };
        options.extend(source.extra().iter().cloned());
        Ok(options)
    }

    /// Persists the moved session and either prompts for the next phase or commits
    async fn advance(&self, schema: &FormSchema, mut session: Session, moved: Moved) -> Result<EngineResult> {
        // terminal position is stored first so a failed commit can be retried
        if let Err(e) = self.sessions.put(&mut session).await {
            return self.fail(&session, e).await;
        }
        match moved {
            Moved::Waiting { phase, repeat } => {
                let prompt = match self.prompt_for(schema, &session, &phase, repeat).await {
                    Ok(prompt) => prompt,
                    Err(e) => return self.fail(&session, e).await,
                };
                self.deliver(session.owner_id, &prompt).await;
                debug!(owner_id = %session.owner_id, schema = %schema.id, phase = %phase, "Waiting for input");
                Ok(EngineResult {
                    prompt,
                    status: DialogStatus::WaitingForInput { phase },
                })
            }
            Moved::Terminal { .. } => self.finish(schema, session).await,
        }
    }

    async fn finish(&self, schema: &FormSchema, session: Session) -> Result<EngineResult> {
        let owner = session.owner_id;
        let outcome = match self.committer.commit(schema, &session).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(owner_id = %owner, schema = %schema.id, error = %e, "Commit failed, session kept for retry");
                self.deliver(owner, &Prompt::text(TRY_LATER_TEXT)).await;
                return Err(e);
            }
        };
        if let Err(e) = self.sessions.delete(owner).await {
            // records are in; keep a marker so no later event writes them again
            warn!(owner_id = %owner, error = %e, "Could not delete committed session");
            let mut committed = session.clone();
            committed.committed = true;
            if let Err(e) = self.sessions.put(&mut committed).await {
                warn!(owner_id = %owner, error = %e, "Could not mark session as committed");
            }
        }

        let done = schema.phase(&session.phase)?;
        let mut text = render::fill_template(&done.prompt, &session.fields);
        let status = if outcome.is_complete() {
            DialogStatus::Completed {
                written: outcome.written,
            }
        } else {
            text = format!(
                "{text}\n\nВнимание: сохранено только {} из {} записей. Проверьте данные и при необходимости заполните форму ещё раз.",
                outcome.written, outcome.total
            );
            DialogStatus::PartiallyCommitted {
                written: outcome.written,
                total: outcome.total,
            }
        };
        info!(owner_id = %owner, schema = %schema.id, ?status, "Form session finished");

        let prompt = Prompt::text(text);
        self.deliver(owner, &prompt).await;
        Ok(EngineResult { prompt, status })
    }

    /// Re-issues the current prompt after a rejected answer; the stored session is untouched
    async fn reject(&self, schema: &FormSchema, session: &Session, reason: String) -> Result<EngineResult> {
        warn!(owner_id = %session.owner_id, phase = %session.phase, reason = %reason, "Input rejected");
        let repeat = is_repeat(schema, session);
        match self.prompt_for(schema, session, &session.phase, repeat).await {
            Ok(current) => {
                let prompt = Prompt::with_choices(format!("{reason}\n\n{}", current.text), current.choices);
                self.deliver(session.owner_id, &prompt).await;
            }
            Err(e) => {
                warn!(owner_id = %session.owner_id, error = %e, "Could not rebuild prompt after rejection");
                self.deliver(session.owner_id, &Prompt::text(reason.clone())).await;
            }
        }
        Err(FormError::Validation(reason))
    }

    /// Reports a failed event: broken schemas abort, upstream outages ask the owner to retry
    async fn fail(&self, session: &Session, err: FormError) -> Result<EngineResult> {
        match err {
            e @ FormError::SchemaIntegrity(_) => self.abort(session, e).await,
            e if e.is_transient() => {
                warn!(owner_id = %session.owner_id, phase = %session.phase, error = %e, "Upstream failure while handling event");
                self.deliver(session.owner_id, &Prompt::text(TRY_LATER_TEXT)).await;
                Err(e)
            }
            e => Err(e),
        }
    }

    /// Ends a conversation whose schema is broken
    async fn abort(&self, session: &Session, err: FormError) -> Result<EngineResult> {
        error!(
            owner_id = %session.owner_id,
            schema = %session.schema_id,
            phase = %session.phase,
            error = %err,
            "Schema integrity violation, aborting form session"
        );
        if let Err(e) = self.sessions.delete(session.owner_id).await {
            warn!(owner_id = %session.owner_id, error = %e, "Could not delete aborted session");
        }
        self.deliver(session.owner_id, &Prompt::text(ABORTED_TEXT)).await;
        Err(err)
    }

    async fn prompt_for(&self, schema: &FormSchema, session: &Session, phase_id: &str, repeat: bool) -> Result<Prompt> {
        let phase = schema.phase(phase_id)?;
        let text = render::phase_text(schema, session, phase, repeat);
        match &phase.input {
            InputKind::SingleChoice(source) => {
                let choices = self
                    .options(source, &session.visible_fields())
                    .await?
                    .iter()
                    .map(CatalogOption::to_choice)
                    .collect();
                Ok(Prompt::with_choices(text, choices))
            }
            _ => Ok(Prompt::text(text)),
        }
    }

    /// Sends a prompt; a failed delivery is logged, never fatal, since the session is already saved
    async fn deliver(&self, owner: OwnerId, prompt: &Prompt) {
        if let Err(e) = self.collaborators.sink.notify(owner, prompt).await {
            warn!(owner_id = %owner, error = %e, "Failed to deliver prompt");
        }
    }

    async fn live_session(&self, owner: OwnerId) -> Result<Option<Session>> {
        let Some(session) = self.sessions.get(owner).await? else {
            return Ok(None);
        };
        if session.committed {
            self.sessions.delete(owner).await?;
            return Ok(None);
        }
        if self.is_expired(&session) {
            info!(owner_id = %owner, schema = %session.schema_id, "Form session expired");
            self.sessions.delete(owner).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    fn idle_cutoff(&self) -> Option<chrono::DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.config.session_ttl?).ok()?;
        Utc::now().checked_sub_signed(ttl)
    }

    fn is_expired(&self, session: &Session) -> bool {
        self.idle_cutoff()
            .is_some_and(|cutoff| session.is_idle_since(cutoff))
    }
}

/// Whether the owner's conversation is over after this outcome
fn closes_session(result: &Result<EngineResult>) -> bool {
    match result {
        Ok(result) => !matches!(result.status, DialogStatus::WaitingForInput { .. }),
        Err(e) => matches!(e, FormError::NoActiveSession(_) | FormError::SchemaIntegrity(_)),
    }
}

/// Whether the session sits at a phase it has already been through
fn is_repeat(schema: &FormSchema, session: &Session) -> bool {
    let Ok(phase) = schema.phase(&session.phase) else {
        return false;
    };
    if schema.group_entered_at(&phase.id).is_some() && !session.pending_group.is_empty() {
        return true;
    }
    match (&phase.transition, &phase.field) {
        (Transition::Repeat { .. }, Some(field)) => {
            let scope = match &phase.group {
                Some(_) => session.current_item.as_ref(),
                None => Some(&session.fields),
            };
            scope
                .and_then(|f| f.get_value(field))
                .and_then(Value::as_array)
                .is_some_and(|values| !values.is_empty())
        }
        _ => false,
    }
}
