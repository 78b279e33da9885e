use common::domain::{DomainError, DomainResult};
use rumqttc::QoS;

/// Longest topic the MQTT wire format can carry
const MAX_TOPIC_LEN: usize = 65_535;

/// Check that `filter` is a subscribable MQTT topic filter.
///
/// `+` and `#` must each occupy a whole level and `#` may only appear as the
/// last level.
///
/// # Examples
/// ```
/// use ingestion_worker::mqtt::validate_topic_filter;
///
/// assert!(validate_topic_filter("channels/+/publish").is_ok());
/// assert!(validate_topic_filter("sensors/#/raw").is_err());
/// ```
pub fn validate_topic_filter(filter: &str) -> DomainResult<()> {
    if filter.is_empty() {
        return Err(DomainError::InvalidTopicFilter(
            "topic filter cannot be empty".to_string(),
        ));
    }

    if filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(DomainError::InvalidTopicFilter(format!(
            "'{}' is not encodable as an MQTT topic",
            filter.replace('\0', "\\0")
        )));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (idx, level) in levels.iter().enumerate() {
        match *level {
            "#" if idx != last => {
                return Err(DomainError::InvalidTopicFilter(format!(
                    "'{}': multi-level wildcard must be the last level",
                    filter
                )));
            }
            "#" | "+" => {}
            _ if level.contains(['#', '+']) => {
                return Err(DomainError::InvalidTopicFilter(format!(
                    "'{}': wildcard must occupy an entire level",
                    filter
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Split a comma separated filter list, dropping blanks and validating each entry.
pub fn parse_topic_filters(list: &str) -> DomainResult<Vec<String>> {
    let filters: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .map(str::to_string)
        .collect();

    if filters.is_empty() {
        return Err(DomainError::InvalidTopicFilter(
            "at least one topic filter is required".to_string(),
        ));
    }

    for filter in &filters {
        validate_topic_filter(filter)?;
    }

    Ok(filters)
}

/// Map a numeric QoS level (0, 1 or 2) to the client's QoS type
pub fn parse_qos(level: u8) -> DomainResult<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(DomainError::InvalidConfiguration(format!(
            "MQTT QoS must be 0, 1 or 2, got {}",
            other
        ))),
    }
}
