//! Context-budget compaction (§4.2).
//!
//! Produces a view of a session's history that fits `max_context_tokens`
//! without mutating the persisted log. Re-running compaction on its own
//! output must be a no-op — every step here only removes from the *middle*
//! of the history, leaving the always-retained head and tail untouched, so a
//! second pass finds nothing left to drop.

use relay_core::types::{Importance, Message, Role};

use crate::types::Session;

/// Budget inputs for one compaction pass.
#[derive(Debug, Clone, Copy)]
pub struct CompactionBudget {
    pub max_context_tokens: u32,
    pub keep_recent: usize,
}

/// Produces a replacement summary for the portion of history being dropped.
/// Implemented by the caller (the Agent Runtime, backed by an LLM provider)
/// so this crate stays free of any provider dependency.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, dropped_prefix: &str) -> String;
}

/// Result of a compaction pass.
pub struct CompactedView {
    pub messages: Vec<Message>,
    /// `Some` only when step 4 (LLM summarization) ran; the caller should
    /// persist this as the session's new `summary`.
    pub new_summary: Option<String>,
}

/// Run the 4-step compaction algorithm against `session`'s live history.
pub fn compact(session: &Session, budget: CompactionBudget, summarizer: &dyn Summarizer) -> CompactedView {
    let messages = &session.messages;

    if messages.is_empty() {
        return CompactedView { messages: Vec::new(), new_summary: session.summary.clone() };
    }

    let first_system = matches!(messages[0].role, Role::System).then(|| messages[0].clone());
    let body_start = if first_system.is_some() { 1 } else { 0 };

    let tail_start = extend_for_pairing(messages, tail_start_index(messages, body_start, budget.keep_recent));
    let mut middle: Vec<(usize, Message)> =
        (body_start..tail_start).map(|i| (i, messages[i].clone())).collect();
    let tail: Vec<Message> = messages[tail_start..].to_vec();

    let summary_msg = session.summary.clone().map(synthetic_summary_message);

    let retained_len = |middle: &[(usize, Message)]| -> u32 {
        first_system.iter().map(|m| m.token_estimate).sum::<u32>()
            + summary_msg.iter().map(|m| m.token_estimate).sum::<u32>()
            + middle.iter().map(|(_, m)| m.token_estimate).sum::<u32>()
            + tail.iter().map(|m| m.token_estimate).sum::<u32>()
    };

    if retained_len(&middle) <= budget.max_context_tokens {
        return assemble(first_system, summary_msg, middle.into_iter().map(|(_, m)| m).collect(), tail, None);
    }

    // Step 2: drop low-importance messages, oldest first.
    drop_while_over_budget(&mut middle, &tail, &first_system, &summary_msg, budget.max_context_tokens, Importance::Low, None);

    if retained_len(&middle) <= budget.max_context_tokens {
        return assemble(first_system, summary_msg, middle.into_iter().map(|(_, m)| m).collect(), tail, None);
    }

    // Step 3: drop normal-importance messages, oldest first, skipping any
    // message whose tool_call/tool_result pair partner is still retained.
    let retained_indices: std::collections::HashSet<usize> =
        middle.iter().map(|(i, _)| *i).chain(0..body_start).chain(tail_start..messages.len()).collect();
    drop_while_over_budget(
        &mut middle,
        &tail,
        &first_system,
        &summary_msg,
        budget.max_context_tokens,
        Importance::Normal,
        Some((messages, &retained_indices)),
    );

    if retained_len(&middle) <= budget.max_context_tokens {
        return assemble(first_system, summary_msg, middle.into_iter().map(|(_, m)| m).collect(), tail, None);
    }

    // Step 4: everything still in `middle` becomes the dropped prefix; the
    // provider summarizes it into a fresh summary replacing the old one.
    let dropped_text = middle
        .iter()
        .map(|(_, m)| format!("[{:?}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let new_summary = summarizer.summarize(&dropped_text);
    let new_summary_msg = synthetic_summary_message(new_summary.clone());

    assemble(first_system, Some(new_summary_msg), Vec::new(), tail, Some(new_summary))
}

fn assemble(
    first_system: Option<Message>,
    summary_msg: Option<Message>,
    middle: Vec<Message>,
    tail: Vec<Message>,
    new_summary: Option<String>,
) -> CompactedView {
    let mut messages = Vec::with_capacity(2 + middle.len() + tail.len());
    messages.extend(first_system);
    messages.extend(summary_msg);
    messages.extend(middle);
    messages.extend(tail);
    CompactedView { messages, new_summary }
}

fn synthetic_summary_message(summary: String) -> Message {
    Message {
        role: Role::System,
        content: format!("[Summary of earlier conversation]\n{summary}"),
        tool_calls: Vec::new(),
        tool_result: None,
        timestamp: chrono::Utc::now(),
        token_estimate: estimate_tokens(&summary),
        importance: Importance::High,
    }
}

fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4).max(1) as u32
}

/// Index where the always-retained tail window begins: the last
/// `keep_recent` messages in `[body_start, len)`.
fn tail_start_index(messages: &[Message], body_start: usize, keep_recent: usize) -> usize {
    let len = messages.len();
    if len - body_start <= keep_recent {
        body_start
    } else {
        len - keep_recent
    }
}

/// If the computed tail boundary would split a tool_call from its matching
/// tool_result, pull the boundary back to include the whole pair.
fn extend_for_pairing(messages: &[Message], tail_start: usize) -> usize {
    if tail_start == 0 || tail_start >= messages.len() {
        return tail_start;
    }
    // If the message just inside the tail is a tool result whose tool_call
    // sits just outside it, extend the tail left by one to keep them together.
    if let Some(result) = messages[tail_start].tool_result.as_ref() {
        if tail_start > 0 {
            let prev = &messages[tail_start - 1];
            if prev.tool_calls.iter().any(|c| c.id == result.tool_call_id) {
                return tail_start - 1;
            }
        }
    }
    tail_start
}

fn drop_while_over_budget(
    middle: &mut Vec<(usize, Message)>,
    tail: &[Message],
    first_system: &Option<Message>,
    summary_msg: &Option<Message>,
    max_tokens: u32,
    target_importance: Importance,
    pairing: Option<(&[Message], &std::collections::HashSet<usize>)>,
) {
    let current_total = |middle: &[(usize, Message)]| -> u32 {
        first_system.iter().map(|m| m.token_estimate).sum::<u32>()
            + summary_msg.iter().map(|m| m.token_estimate).sum::<u32>()
            + middle.iter().map(|(_, m)| m.token_estimate).sum::<u32>()
            + tail.iter().map(|m| m.token_estimate).sum::<u32>()
    };

    loop {
        if current_total(middle) <= max_tokens {
            return;
        }
        let Some(drop_pos) = middle.iter().position(|(idx, m)| {
            m.importance == target_importance && !is_paired_with_retained(*idx, pairing)
        }) else {
            return;
        };
        middle.remove(drop_pos);
    }
}

fn is_paired_with_retained(idx: usize, pairing: Option<(&[Message], &std::collections::HashSet<usize>)>) -> bool {
    let Some((messages, retained)) = pairing else { return false };
    let msg = &messages[idx];
    if let Some(result) = msg.tool_result.as_ref() {
        // This is a tool_result; paired tool_call usually precedes it.
        return messages[..idx]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.tool_calls.iter().any(|c| c.id == result.tool_call_id))
            .map(|(i, _)| retained.contains(&i))
            .unwrap_or(false);
    }
    if !msg.tool_calls.is_empty() {
        return messages[idx + 1..].iter().enumerate().any(|(offset, m)| {
            m.tool_result.as_ref().map(|r| msg.tool_calls.iter().any(|c| c.id == r.tool_call_id)).unwrap_or(false)
                && retained.contains(&(idx + 1 + offset))
        });
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::SessionId;
    use std::path::PathBuf;

    struct EchoSummarizer;
    impl Summarizer for EchoSummarizer {
        fn summarize(&self, dropped_prefix: &str) -> String {
            format!("summary of {} chars", dropped_prefix.len())
        }
    }

    fn msg(role: Role, content: &str, importance: Importance, tokens: u32) -> Message {
        Message {
            role,
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_result: None,
            timestamp: chrono::Utc::now(),
            token_estimate: tokens,
            importance,
        }
    }

    fn session_with(messages: Vec<Message>) -> Session {
        let mut s = Session::new(SessionId::from("s1"), PathBuf::from("/tmp/ws"));
        s.messages = messages;
        s
    }

    #[test]
    fn under_budget_is_untouched() {
        let session = session_with(vec![
            msg(Role::System, "sys", Importance::High, 5),
            msg(Role::User, "hi", Importance::Normal, 5),
        ]);
        let view = compact(&session, CompactionBudget { max_context_tokens: 1000, keep_recent: 10 }, &EchoSummarizer);
        assert_eq!(view.messages.len(), 2);
        assert!(view.new_summary.is_none());
    }

    #[test]
    fn drops_low_importance_first() {
        let mut messages = vec![msg(Role::System, "sys", Importance::High, 2)];
        for i in 0..20 {
            messages.push(msg(Role::Assistant, &format!("ack {i}"), Importance::Low, 50));
        }
        messages.push(msg(Role::User, "final question", Importance::Normal, 10));
        let session = session_with(messages);

        let view = compact(&session, CompactionBudget { max_context_tokens: 100, keep_recent: 1 }, &EchoSummarizer);
        // low-importance acks should be gone, system + last message retained
        assert!(view.messages.iter().all(|m| m.importance != Importance::Low));
        assert_eq!(view.messages.first().unwrap().content, "sys");
    }

    #[test]
    fn falls_back_to_summary_when_still_over_budget() {
        // Step 3 can only drop Normal-importance messages, so pin enough
        // High-importance weight in the middle (the "important fact"
        // messages below) that dropping every droppable message still
        // leaves the total over budget — otherwise step 3 alone would
        // satisfy the budget and step 4 would never run.
        let mut messages = vec![msg(Role::System, "sys", Importance::High, 2)];
        for i in 0..5 {
            messages.push(msg(Role::Assistant, &format!("important fact {i}"), Importance::High, 100));
        }
        for i in 0..15 {
            messages.push(msg(Role::User, &format!("small talk {i}"), Importance::Normal, 60));
        }
        messages.push(msg(Role::User, "final question", Importance::Normal, 60));
        let session = session_with(messages);

        let view = compact(&session, CompactionBudget { max_context_tokens: 300, keep_recent: 1 }, &EchoSummarizer);
        assert!(view.new_summary.is_some());
        assert!(view.messages.iter().any(|m| m.content.contains("Summary of earlier conversation")));
        // The pinned High-importance facts survived steps 2 and 3 and were
        // only removed by being folded into the summary at step 4.
        assert!(!view.messages.iter().any(|m| m.content.starts_with("important fact")));
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let mut messages = vec![msg(Role::System, "sys", Importance::High, 2)];
        for i in 0..20 {
            messages.push(msg(Role::Assistant, &format!("ack {i}"), Importance::Low, 50));
        }
        messages.push(msg(Role::User, "final", Importance::Normal, 10));
        let session = session_with(messages);
        let budget = CompactionBudget { max_context_tokens: 100, keep_recent: 1 };

        let first = compact(&session, budget, &EchoSummarizer);
        let mut second_session = session_with(first.messages.clone());
        second_session.summary = first.new_summary.clone();
        let second = compact(&second_session, budget, &EchoSummarizer);

        assert_eq!(first.messages.len(), second.messages.len());
    }
}
