//! Conversation data model: interview context, session record, turns and
//! the analytics derived from them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One question the interviewer may ask.
#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub kind: String,
    pub difficulty: String,
}

/// Interview context supplied by the surrounding application. The session
/// holds a mutable copy it may patch while running.
#[derive(Debug, Clone)]
pub struct InterviewContext {
    pub id: String,
    pub job_title: String,
    pub company: Option<String>,
    pub focus_areas: Vec<String>,
    pub difficulty: String,
    pub questions: Vec<Question>,
    pub current_question: usize,
}

/// Partial update to an [`InterviewContext`]; unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub job_title: Option<String>,
    pub company: Option<Option<String>>,
    pub focus_areas: Option<Vec<String>>,
    pub difficulty: Option<String>,
    pub questions: Option<Vec<Question>>,
    pub current_question: Option<usize>,
}

impl InterviewContext {
    pub fn apply(&mut self, patch: ContextPatch) {
        if let Some(v) = patch.job_title {
            self.job_title = v;
        }
        if let Some(v) = patch.company {
            self.company = v;
        }
        if let Some(v) = patch.focus_areas {
            self.focus_areas = v;
        }
        if let Some(v) = patch.difficulty {
            self.difficulty = v;
        }
        if let Some(v) = patch.questions {
            self.questions = v;
        }
        if let Some(v) = patch.current_question {
            self.current_question = v;
        }
    }
}

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One uninterrupted span of speech attributed to a single role.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

/// A timestamped compressed still image taken during screen recording.
#[derive(Debug, Clone)]
pub struct ScreenFrameRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: Bytes,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Aggregate figures computed once at session finalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analytics {
    pub total_turns: usize,
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub user_speaking_secs: f64,
    pub assistant_speaking_secs: f64,
    /// Mean gap between a user turn and the assistant turn that follows it.
    pub average_response_secs: f64,
    pub interruption_count: usize,
}

/// The record of one live session, finalized and handed to the caller at
/// session end.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub model: String,
    pub turns: Vec<ConversationTurn>,
    pub screen_captures: Vec<ScreenFrameRecord>,
    pub analytics: Analytics,
    interruptions: usize,
}

impl ConversationSession {
    pub fn new(model: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 0.0,
            model,
            turns: Vec::new(),
            screen_captures: Vec::new(),
            analytics: Analytics::default(),
            interruptions: 0,
        }
    }

    /// Append a transcript fragment. Consecutive fragments from the same role
    /// extend the current turn (joined with a single space); a role change
    /// starts a new turn.
    pub fn append_fragment(&mut self, role: Role, text: &str) {
        self.append_fragment_at(role, text, Utc::now());
    }

    pub fn append_fragment_at(&mut self, role: Role, text: &str, timestamp: DateTime<Utc>) {
        match self.turns.last_mut() {
            Some(turn) if turn.role == role => {
                // Separate fragments with a single space, unless one side
                // already carries the whitespace.
                if !turn.content.is_empty()
                    && !text.is_empty()
                    && !turn.content.ends_with(char::is_whitespace)
                    && !text.starts_with(char::is_whitespace)
                {
                    turn.content.push(' ');
                }
                turn.content.push_str(text);
            }
            _ => self.turns.push(ConversationTurn {
                id: Uuid::new_v4(),
                timestamp,
                role,
                content: text.to_string(),
            }),
        }
    }

    pub fn record_screen_capture(&mut self, frame: ScreenFrameRecord) {
        self.screen_captures.push(frame);
    }

    pub fn record_interruption(&mut self) {
        self.interruptions += 1;
    }

    /// Close the session: stamp the end time, compute the duration and derive
    /// analytics from the turns list. Called exactly once.
    pub fn finalize(&mut self) {
        self.finalize_at(Utc::now());
    }

    pub fn finalize_at(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
        self.duration_secs = seconds_between(self.started_at, ended_at);
        self.analytics = self.compute_analytics(ended_at);
    }

    fn compute_analytics(&self, ended_at: DateTime<Utc>) -> Analytics {
        let mut analytics = Analytics {
            total_turns: self.turns.len(),
            interruption_count: self.interruptions,
            ..Analytics::default()
        };

        let mut response_gaps: Vec<f64> = Vec::new();
        for (i, turn) in self.turns.iter().enumerate() {
            match turn.role {
                Role::User => analytics.user_turns += 1,
                Role::Assistant => {
                    analytics.assistant_turns += 1;
                    if let Some(prev) = i.checked_sub(1).and_then(|j| self.turns.get(j)) {
                        if prev.role == Role::User {
                            response_gaps.push(seconds_between(prev.timestamp, turn.timestamp));
                        }
                    }
                }
            }

            // A turn is considered to span until the next turn starts, the
            // last one until the session ends.
            let span_end = self
                .turns
                .get(i + 1)
                .map(|next| next.timestamp)
                .unwrap_or(ended_at);
            let span = seconds_between(turn.timestamp, span_end).max(0.0);
            match turn.role {
                Role::User => analytics.user_speaking_secs += span,
                Role::Assistant => analytics.assistant_speaking_secs += span,
            }
        }

        if !response_gaps.is_empty() {
            analytics.average_response_secs =
                response_gaps.iter().sum::<f64>() / response_gaps.len() as f64;
        }
        analytics
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fragments_accumulate_until_role_changes() {
        let mut session = ConversationSession::new("test-model".into());
        session.append_fragment_at(Role::User, "Hi", at(0));
        session.append_fragment_at(Role::User, " there", at(1));
        session.append_fragment_at(Role::User, "friend", at(2));
        session.append_fragment_at(Role::Assistant, "Hello", at(3));

        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0].role, Role::User);
        // A fragment with its own leading space must not gain a second one.
        assert_eq!(session.turns[0].content, "Hi there friend");
        assert_eq!(session.turns[1].role, Role::Assistant);
        assert_eq!(session.turns[1].content, "Hello");
    }

    #[test]
    fn empty_fragment_does_not_insert_stray_space() {
        let mut session = ConversationSession::new("m".into());
        session.append_fragment_at(Role::User, "", at(0));
        session.append_fragment_at(Role::User, "Hello", at(1));
        assert_eq!(session.turns[0].content, "Hello");
    }

    #[test]
    fn average_response_time_is_mean_of_user_to_assistant_gaps() {
        let mut session = ConversationSession::new("m".into());
        session.started_at = at(0);
        session.append_fragment_at(Role::User, "q1", at(0));
        session.append_fragment_at(Role::Assistant, "a1", at(5));
        session.append_fragment_at(Role::User, "q2", at(10));
        session.append_fragment_at(Role::Assistant, "a2", at(13));
        session.finalize_at(at(20));

        let a = &session.analytics;
        assert_eq!(a.total_turns, 4);
        assert_eq!(a.user_turns, 2);
        assert_eq!(a.assistant_turns, 2);
        assert!((a.average_response_secs - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn speaking_time_spans_until_next_turn() {
        let mut session = ConversationSession::new("m".into());
        session.started_at = at(0);
        session.append_fragment_at(Role::User, "q", at(0));
        session.append_fragment_at(Role::Assistant, "a", at(4));
        session.finalize_at(at(10));

        let a = &session.analytics;
        assert!((a.user_speaking_secs - 4.0).abs() < f64::EPSILON);
        assert!((a.assistant_speaking_secs - 6.0).abs() < f64::EPSILON);
        assert!((session.duration_secs - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn interruptions_are_counted_into_analytics() {
        let mut session = ConversationSession::new("m".into());
        session.record_interruption();
        session.record_interruption();
        session.finalize_at(at(1));
        assert_eq!(session.analytics.interruption_count, 2);
    }

    #[test]
    fn context_patch_applies_only_set_fields() {
        let mut ctx = InterviewContext {
            id: "i1".into(),
            job_title: "Backend Engineer".into(),
            company: Some("Acme".into()),
            focus_areas: vec!["rust".into()],
            difficulty: "medium".into(),
            questions: vec![],
            current_question: 0,
        };
        ctx.apply(ContextPatch {
            current_question: Some(2),
            company: Some(None),
            ..ContextPatch::default()
        });
        assert_eq!(ctx.current_question, 2);
        assert_eq!(ctx.company, None);
        assert_eq!(ctx.job_title, "Backend Engineer");
    }
}
