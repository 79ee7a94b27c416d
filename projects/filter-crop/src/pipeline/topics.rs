use crate::config::TopicMode;
use crate::pipeline::types::MAIN_TOPIC;

/// Topics of the current batch eligible for extraction.
///
/// `All` keeps batch order, `Selected` keeps configured order. Configured
/// topics missing from the batch are skipped silently.
pub fn select_topics<S: AsRef<str>>(
    mode: TopicMode,
    configured: &[String],
    present: &[S],
) -> Vec<String> {
    let is_present = |topic: &str| present.iter().any(|p| p.as_ref() == topic);

    match mode {
        TopicMode::All => present.iter().map(|p| p.as_ref().to_string()).collect(),
        TopicMode::MainOnly => {
            if is_present(MAIN_TOPIC) {
                vec![MAIN_TOPIC.to_string()]
            } else {
                Vec::new()
            }
        }
        TopicMode::Selected => configured
            .iter()
            .filter(|topic| is_present(topic.as_str()))
            .cloned()
            .collect(),
    }
}
