use chrono::Utc;
use serde_json::{json, Value};

use crate::modbus::registers::BankValues;
use crate::services::poll_service::WatchUpdate;

pub trait UpdateFormatter: Send + Sync {
    fn format_update(&self, update: &WatchUpdate) -> String;
    fn format_values(&self, values: &BankValues) -> String;
    fn format_header(&self) -> String;
}

pub struct ConsoleFormatter;

impl UpdateFormatter for ConsoleFormatter {
    fn format_update(&self, update: &WatchUpdate) -> String {
        match &update.result {
            Ok(values) => format!(
                "📊 [{}] {} {}..+{}: {}",
                update.timestamp.format("%H:%M:%S%.3f"),
                update.bank,
                update.start,
                update.count,
                self.format_values(values)
            ),
            Err(e) => format!(
                "❌ [{}] {} {}..+{}: {}",
                update.timestamp.format("%H:%M:%S%.3f"),
                update.bank,
                update.start,
                update.count,
                e
            ),
        }
    }

    fn format_values(&self, values: &BankValues) -> String {
        match values {
            BankValues::Bits(bits) => {
                let rendered: Vec<&str> = bits.iter().map(|b| if *b { "ON" } else { "OFF" }).collect();
                format!("[{}]", rendered.join(", "))
            }
            BankValues::Words(words) => {
                let rendered: Vec<String> = words.iter().map(|w| w.to_string()).collect();
                format!("[{}]", rendered.join(", "))
            }
        }
    }

    fn format_header(&self) -> String {
        format!("🚀 Modbus Watch Data - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub struct JsonFormatter;

impl JsonFormatter {
    fn values_to_json(values: &BankValues) -> Value {
        match values {
            BankValues::Bits(bits) => json!(bits),
            BankValues::Words(words) => json!(words),
        }
    }
}

impl UpdateFormatter for JsonFormatter {
    fn format_update(&self, update: &WatchUpdate) -> String {
        let payload = match &update.result {
            Ok(values) => json!({
                "watch_id": update.watch_id.to_string(),
                "bank": update.bank.to_string(),
                "start": update.start,
                "count": update.count,
                "timestamp": update.timestamp.to_rfc3339(),
                "values": Self::values_to_json(values),
            }),
            Err(e) => json!({
                "watch_id": update.watch_id.to_string(),
                "bank": update.bank.to_string(),
                "start": update.start,
                "count": update.count,
                "timestamp": update.timestamp.to_rfc3339(),
                "error": e.to_string(),
            }),
        };
        serde_json::to_string(&payload).unwrap_or_default()
    }

    fn format_values(&self, values: &BankValues) -> String {
        serde_json::to_string(&Self::values_to_json(values)).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::frame::RegisterBank;
    use uuid::Uuid;

    fn sample_update() -> WatchUpdate {
        WatchUpdate {
            watch_id: Uuid::new_v4(),
            bank: RegisterBank::HoldingRegisters,
            start: 0,
            count: 3,
            timestamp: Utc::now(),
            result: Ok(BankValues::Words(vec![3, 17, 0])),
        }
    }

    #[test]
    fn test_console_formatter_lists_values() {
        let formatter = ConsoleFormatter;
        let line = formatter.format_update(&sample_update());
        assert!(line.contains("holding-registers"));
        assert!(line.contains("[3, 17, 0]"));
    }

    #[test]
    fn test_console_formatter_renders_bits_as_on_off() {
        let formatter = ConsoleFormatter;
        let rendered = formatter.format_values(&BankValues::Bits(vec![true, false]));
        assert_eq!(rendered, "[ON, OFF]");
    }

    #[test]
    fn test_json_formatter_emits_parseable_output() {
        let formatter = JsonFormatter;
        let line = formatter.format_update(&sample_update());
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["bank"], "holding-registers");
        assert_eq!(parsed["values"], json!([3, 17, 0]));
    }
}
