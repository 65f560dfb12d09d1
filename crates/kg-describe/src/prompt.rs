//! Builds the describe prompt, including the retry-with-feedback section
//! appended after a malformed LLM response.

const MAX_PRIOR_RESPONSE_CHARS: usize = 2000;

pub const SYSTEM_PROMPT: &str = "You summarise a cluster of related entities. \
Return a single JSON object with keys \"title\", \"label\", \"description\". \
Do not include any other keys or any text outside the JSON object.";

pub fn build_user_prompt(member_labels: &[(String, Option<String>)]) -> String {
    let mut out = String::from("Cluster members:\n");
    for (label, description) in member_labels {
        match description {
            Some(d) => out.push_str(&format!("- {label}: {d}\n")),
            None => out.push_str(&format!("- {label}\n")),
        }
    }
    out.push_str(
        "\nReturn JSON: {\"title\": ..., \"label\": ..., \"description\": ...}",
    );
    out
}

/// Appends a retry section describing the previous parse failure, truncating
/// the prior response to keep the prompt bounded.
pub fn append_retry_feedback(base_prompt: &str, parse_error: &str, prior_response: &str) -> String {
    let truncated: String = if prior_response.len() > MAX_PRIOR_RESPONSE_CHARS {
        format!(
            "{}... [truncated]",
            &prior_response[..MAX_PRIOR_RESPONSE_CHARS]
        )
    } else {
        prior_response.to_string()
    };
    format!(
        "{base_prompt}\n\nRETRY - JSON PARSE ERROR:\n{parse_error}\n\nPrior malformed response:\n{truncated}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_feedback_truncates_long_responses() {
        let prior = "x".repeat(5000);
        let out = append_retry_feedback("base", "unexpected token", &prior);
        assert!(out.contains("RETRY - JSON PARSE ERROR"));
        assert!(out.contains("unexpected token"));
        assert!(out.contains("[truncated]"));
        assert!(out.len() < prior.len());
    }

    #[test]
    fn retry_feedback_keeps_short_responses_verbatim() {
        let out = append_retry_feedback("base", "eof", "{\"incomplete\":");
        assert!(out.contains("{\"incomplete\":"));
        assert!(!out.contains("[truncated]"));
    }

    #[test]
    fn user_prompt_includes_all_members() {
        let members = vec![
            ("Ahab".to_string(), Some("captain".to_string())),
            ("Pequod".to_string(), None),
        ];
        let prompt = build_user_prompt(&members);
        assert!(prompt.contains("Ahab: captain"));
        assert!(prompt.contains("Pequod"));
    }
}
