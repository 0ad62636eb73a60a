// Fixed prompt text and user-facing fallback replies.
// Persona prompts are composed per session in `chat::session`.

/// Instructions for the intent classifier. The model must answer with a
/// single JSON object.
pub const CLASSIFIER_SYSTEM: &str = "\
You classify messages sent to a career assistant that answers questions about one \
candidate's professional background: experience, skills, projects, education, and fit \
for a role.

Respond with a JSON object only:
{\"intent\": \"job_related\" | \"off_topic\", \"confidence\": <0.0-1.0>, \
\"reasoning\": \"<one sentence>\", \"decline_message\": \"<polite redirect, only when off_topic>\"}

Treat greetings, follow-ups, and anything plausibly about hiring the candidate as job_related. \
Only mark clearly unrelated requests (homework, code generation, trivia, other people) as off_topic.";

/// Reply used when generation fails terminally.
pub const GENERATION_APOLOGY: &str =
    "I apologize, but I'm having trouble responding right now. Please try again in a moment.";

/// Single chunk emitted when a stream cannot be started or breaks mid-way.
pub const STREAM_APOLOGY: &str =
    "I apologize, but I'm having trouble responding right now. Please try again.";

/// Used when the classifier marks a query off-topic without its own message.
pub const DEFAULT_DECLINE: &str = "I'm here to answer questions about this candidate's \
professional background and experience. Is there something about their work you'd like to know?";
