//! Topic naming.
//!
//! | Concept                 | Kafka mapping                               |
//! |-------------------------|---------------------------------------------|
//! | command queue `q`       | topic `q`, consumer group `q`               |
//! | event with routing key  | topic `{exchange}.{routing_key}`            |
//! | subscriber queue `q`    | consumer group `q`, regex topic subscription|
//! | requeue of `q`          | topic `q.retry`                             |
//! | dead letters of `q`     | topic `q.dead-letter`                       |

/// Topic a requeued delivery of `queue` is republished to.
#[must_use]
pub fn retry_topic(queue: &str) -> String {
    format!("{queue}.retry")
}

/// Topic dead-lettered deliveries of `queue` are moved to.
#[must_use]
pub fn dead_letter_topic(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

/// Topic an event with `routing_key` is published to.
#[must_use]
pub fn event_topic(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}.{routing_key}")
}

/// librdkafka regex subscription matching every event topic whose routing
/// key matches `binding_key`.
///
/// `*` matches exactly one word and `#` zero or more, as in a topic exchange.
#[must_use]
pub fn binding_pattern(exchange: &str, binding_key: &str) -> String {
    let mut pattern = String::from("^");
    push_escaped(&mut pattern, exchange);
    for word in binding_key.split('.') {
        match word {
            "#" => pattern.push_str(r"(\.[^.]+)*"),
            "*" => pattern.push_str(r"\.[^.]+"),
            literal => {
                pattern.push_str(r"\.");
                push_escaped(&mut pattern, literal);
            },
        }
    }
    pattern.push('$');
    pattern
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        if r".^$|?*+()[]{}\".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_topic_names() {
        assert_eq!(retry_topic("points.commands"), "points.commands.retry");
        assert_eq!(dead_letter_topic("points.commands"), "points.commands.dead-letter");
        assert_eq!(
            event_topic("loyalty.events", "points.deducted"),
            "loyalty.events.points.deducted"
        );
    }

    #[test]
    fn literal_binding_is_anchored_and_escaped() {
        assert_eq!(
            binding_pattern("loyalty.events", "points.deducted"),
            r"^loyalty\.events\.points\.deducted$"
        );
    }

    #[test]
    fn wildcards_translate_word_wise() {
        assert_eq!(
            binding_pattern("ex", "points.*"),
            r"^ex\.points\.[^.]+$"
        );
        assert_eq!(binding_pattern("ex", "points.#"), r"^ex\.points(\.[^.]+)*$");
        assert_eq!(binding_pattern("ex", "#.failed"), r"^ex(\.[^.]+)*\.failed$");
    }
}
