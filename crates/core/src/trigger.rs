use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::enums::TriggerType;
use crate::error::{SchedError, SchedResult};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// PERIOD 类型的触发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodConfig {
    /// 周期起点
    pub start: String,
    /// 周期步长（秒）
    pub step_seconds: u64,
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn invalid(trigger_type: TriggerType, value: &str) -> SchedError {
    SchedError::InvalidTrigger {
        trigger_type: format!("{trigger_type:?}"),
        value: value.to_string(),
    }
}

impl TriggerType {
    /// 校验触发配置是否可解析
    pub fn validate_value(self, value: &str) -> SchedResult<()> {
        match self {
            TriggerType::Cron => {
                Schedule::from_str(value).map_err(|_| invalid(self, value))?;
            }
            TriggerType::Once => {
                parse_datetime(value).ok_or_else(|| invalid(self, value))?;
            }
            TriggerType::Period => {
                let config: PeriodConfig =
                    serde_json::from_str(value).map_err(|_| invalid(self, value))?;
                if config.step_seconds == 0 || parse_datetime(&config.start).is_none() {
                    return Err(invalid(self, value));
                }
            }
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                let secs: i64 = value.trim().parse().map_err(|_| invalid(self, value))?;
                if secs <= 0 {
                    return Err(invalid(self, value));
                }
            }
            TriggerType::Depend => {
                let ids: Vec<&str> = value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
                if ids.is_empty() || ids.iter().any(|s| s.parse::<i64>().is_err()) {
                    return Err(invalid(self, value));
                }
            }
        }
        Ok(())
    }

    /// 计算 base 之后的下一次触发时间
    ///
    /// FIXED_RATE 的 base 是上一次计划触发时间，FIXED_DELAY 的 base 是上一次执行
    /// 结束时间，语义差异由调用方选取 base 体现。DEPEND 类型没有自主触发时间。
    pub fn compute_next_trigger_time(
        self,
        value: &str,
        base: DateTime<Utc>,
    ) -> SchedResult<Option<DateTime<Utc>>> {
        match self {
            TriggerType::Cron => {
                let schedule = Schedule::from_str(value).map_err(|_| invalid(self, value))?;
                Ok(schedule.after(&base).next())
            }
            TriggerType::Once => {
                let at = parse_datetime(value).ok_or_else(|| invalid(self, value))?;
                Ok((at > base).then_some(at))
            }
            TriggerType::Period => {
                let config: PeriodConfig =
                    serde_json::from_str(value).map_err(|_| invalid(self, value))?;
                let start = parse_datetime(&config.start).ok_or_else(|| invalid(self, value))?;
                if config.step_seconds == 0 {
                    return Err(invalid(self, value));
                }
                if start > base {
                    return Ok(Some(start));
                }
                let step_ms = config.step_seconds as i64 * 1000;
                let elapsed = base.timestamp_millis() - start.timestamp_millis();
                let periods = elapsed / step_ms + 1;
                let next_ms = start.timestamp_millis() + periods * step_ms;
                Ok(Utc.timestamp_millis_opt(next_ms).single())
            }
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                let secs: i64 = value.trim().parse().map_err(|_| invalid(self, value))?;
                if secs <= 0 {
                    return Err(invalid(self, value));
                }
                Ok(Some(base + chrono::Duration::seconds(secs)))
            }
            TriggerType::Depend => Ok(None),
        }
    }

    /// 依赖触发的父任务 id 列表
    pub fn parse_depend_parents(self, value: &str) -> SchedResult<Vec<i64>> {
        if self != TriggerType::Depend {
            return Err(invalid(self, value));
        }
        let mut parents = Vec::new();
        for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let id = part.parse::<i64>().map_err(|_| invalid(self, value))?;
            if !parents.contains(&id) {
                parents.push(id);
            }
        }
        if parents.is_empty() {
            return Err(invalid(self, value));
        }
        Ok(parents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> DateTime<Utc> {
        parse_datetime(text).unwrap()
    }

    #[test]
    fn test_cron_next_fire() {
        let next = TriggerType::Cron
            .compute_next_trigger_time("0 0 2 * * *", at("2025-06-01 10:00:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, at("2025-06-02 02:00:00"));
    }

    #[test]
    fn test_once_fires_only_in_future() {
        let value = "2025-06-01 00:00:00";
        let before = TriggerType::Once
            .compute_next_trigger_time(value, at("2025-05-31 00:00:00"))
            .unwrap();
        assert_eq!(before, Some(at(value)));
        let after = TriggerType::Once
            .compute_next_trigger_time(value, at("2025-06-02 00:00:00"))
            .unwrap();
        assert_eq!(after, None);
    }

    #[test]
    fn test_period_aligns_to_step() {
        let value = r#"{"start":"2025-06-01 00:00:00","step_seconds":3600}"#;
        let next = TriggerType::Period
            .compute_next_trigger_time(value, at("2025-06-01 01:30:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, at("2025-06-01 02:00:00"));

        // base 早于起点时返回起点
        let next = TriggerType::Period
            .compute_next_trigger_time(value, at("2025-05-01 00:00:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, at("2025-06-01 00:00:00"));
    }

    #[test]
    fn test_fixed_rate_and_delay() {
        let next = TriggerType::FixedRate
            .compute_next_trigger_time("30", at("2025-06-01 00:00:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, at("2025-06-01 00:00:30"));

        let next = TriggerType::FixedDelay
            .compute_next_trigger_time("90", at("2025-06-01 00:01:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, at("2025-06-01 00:02:30"));
    }

    #[test]
    fn test_depend_parse_and_no_self_trigger() {
        assert_eq!(
            TriggerType::Depend.parse_depend_parents("3, 1, 3, 2").unwrap(),
            vec![3, 1, 2]
        );
        assert!(TriggerType::Depend.parse_depend_parents("a,b").is_err());
        assert_eq!(
            TriggerType::Depend
                .compute_next_trigger_time("1,2", Utc::now())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_validate_values() {
        assert!(TriggerType::Cron.validate_value("0/5 * * * * *").is_ok());
        assert!(TriggerType::Cron.validate_value("not a cron").is_err());
        assert!(TriggerType::FixedRate.validate_value("0").is_err());
        assert!(TriggerType::Period
            .validate_value(r#"{"start":"2025-06-01 00:00:00","step_seconds":60}"#)
            .is_ok());
    }
}
