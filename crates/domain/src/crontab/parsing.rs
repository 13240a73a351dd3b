use jobs_core::{JobsError, JobsResult};

use super::{CrontabExpr, Field, FieldItem};

/// 单个字段的取值规则
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// 超出上限的数值按取模回绕，仅星期字段允许（`7` 即周日）
    wrap_beyond_max: bool,
    names: &'static [(&'static str, u32)],
}

const MONTH_NAMES: &[(&str, u32)] = &[
    ("january", 1),
    ("jan", 1),
    ("february", 2),
    ("feb", 2),
    ("march", 3),
    ("mar", 3),
    ("april", 4),
    ("apr", 4),
    ("may", 5),
    ("june", 6),
    ("jun", 6),
    ("july", 7),
    ("jul", 7),
    ("august", 8),
    ("aug", 8),
    ("september", 9),
    ("sep", 9),
    ("october", 10),
    ("oct", 10),
    ("november", 11),
    ("nov", 11),
    ("december", 12),
    ("dec", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("sunday", 0),
    ("sun", 0),
    ("su", 0),
    ("monday", 1),
    ("mon", 1),
    ("mo", 1),
    ("tuesday", 2),
    ("tue", 2),
    ("tu", 2),
    ("wednesday", 3),
    ("wed", 3),
    ("we", 3),
    ("thursday", 4),
    ("thu", 4),
    ("th", 4),
    ("friday", 5),
    ("fri", 5),
    ("fr", 5),
    ("saturday", 6),
    ("sat", 6),
    ("sa", 6),
];

const MINUTES: FieldSpec = FieldSpec {
    name: "minutes",
    min: 0,
    max: 59,
    wrap_beyond_max: false,
    names: &[],
};
const HOURS: FieldSpec = FieldSpec {
    name: "hours",
    min: 0,
    max: 23,
    wrap_beyond_max: false,
    names: &[],
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "month days",
    min: 1,
    max: 31,
    wrap_beyond_max: false,
    names: &[],
};
const MONTHS: FieldSpec = FieldSpec {
    name: "months",
    min: 1,
    max: 12,
    wrap_beyond_max: false,
    names: MONTH_NAMES,
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "week days",
    min: 0,
    max: 6,
    wrap_beyond_max: true,
    names: WEEKDAY_NAMES,
};

/// 解析5字段的 crontab 表达式（分 时 日 月 周）或 `@daily` 之类的别名。
///
/// 缺省的尾部字段视为 `*`。
pub fn parse(src: &str) -> JobsResult<CrontabExpr> {
    let expanded = match src.trim() {
        "@yearly" | "@annually" => "0 0 1 jan *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * sun",
        "@daily" | "@midnight" | "@nightly" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => other,
    };

    let fields: Vec<&str> = expanded.split_whitespace().collect();
    if fields.len() > 5 {
        return Err(invalid(
            src,
            format!("expected at most 5 fields, not {}", fields.len()),
        ));
    }
    let field = |idx: usize| fields.get(idx).copied().unwrap_or("*");

    let parse_with = |spec: &FieldSpec, idx: usize| {
        spec.parse_field(field(idx)).map_err(|message| invalid(src, message))
    };

    Ok(CrontabExpr::new(
        parse_with(&MINUTES, 0)?,
        parse_with(&HOURS, 1)?,
        parse_with(&DAYS_OF_MONTH, 2)?,
        parse_with(&MONTHS, 3)?,
        parse_with(&DAYS_OF_WEEK, 4)?,
    ))
}

fn invalid(src: &str, message: String) -> JobsError {
    JobsError::InvalidCron {
        expr: src.to_string(),
        message,
    }
}

impl FieldSpec {
    fn full_range(&self, every_nth: u32) -> FieldItem {
        FieldItem {
            every_nth,
            from: self.min,
            through: self.max,
        }
    }

    fn parse_field(&self, src: &str) -> Result<Field, String> {
        if src == "*" {
            return Ok(Field::new(vec![self.full_range(1)], self.min, self.max));
        }

        let mut items = Vec::new();
        for part in src.split(',') {
            let (range, step) = match part.find('/') {
                Some(idx) if idx > 0 => (&part[..idx], Some(self.parse_step(&part[idx + 1..])?)),
                _ => (part, None),
            };

            let item = if range == "*" {
                self.full_range(step.unwrap_or(1))
            } else {
                match range.find('-') {
                    Some(idx) if idx > 0 => {
                        let from = self.parse_value(&range[..idx])?;
                        let through = self.parse_value(&range[idx + 1..])?;
                        if from > through {
                            return Err(format!(
                                "field '{}' range '{}' start {} must not be after end {}",
                                self.name, range, from, through
                            ));
                        }
                        FieldItem {
                            every_nth: step.unwrap_or(0),
                            from,
                            through,
                        }
                    }
                    _ => {
                        let from = self.parse_value(range)?;
                        FieldItem {
                            every_nth: step.unwrap_or(0),
                            from,
                            through: if step.is_some() { self.max } else { from },
                        }
                    }
                }
            };
            items.push(item);
        }
        Ok(Field::new(items, self.min, self.max))
    }

    fn parse_step(&self, src: &str) -> Result<u32, String> {
        let step: u32 = src
            .parse()
            .map_err(|e| format!("field '{}/n' value '{}' faulty: {}", self.name, src, e))?;
        if step == 0 {
            return Err(format!("field '{}/n' step must be at least 1", self.name));
        }
        Ok(step)
    }

    fn parse_value(&self, src: &str) -> Result<u32, String> {
        let lower = src.to_ascii_lowercase();
        if let Some((_, value)) = self.names.iter().find(|(name, _)| *name == lower) {
            return Ok(*value);
        }

        let value: u32 = src
            .parse()
            .map_err(|e| format!("field '{}' value '{}' faulty: {}", self.name, src, e))?;
        if value > self.max && self.wrap_beyond_max {
            return Ok(self.min + (value - self.min) % (1 + self.max - self.min));
        }
        if value < self.min || value > self.max {
            return Err(format!(
                "expected '{}' field to be in the range {}-{} but got {}",
                self.name, self.min, self.max, value
            ));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(every_nth: u32, from: u32, through: u32) -> FieldItem {
        FieldItem {
            every_nth,
            from,
            through,
        }
    }

    #[test]
    fn test_parse_mixed_items() {
        let expr = parse("5,3-27/4,7/2 4/3 7/2 feb-sep 4,sun-tu").unwrap();
        assert_eq!(
            expr.minutes.items(),
            &[item(0, 5, 5), item(4, 3, 27), item(2, 7, 59)]
        );
        assert_eq!(expr.hours.items(), &[item(3, 4, 23)]);
        assert_eq!(expr.days_of_month.items(), &[item(2, 7, 31)]);
        assert_eq!(expr.months.items(), &[item(0, 2, 9)]);
        assert_eq!(expr.days_of_week.items(), &[item(0, 4, 4), item(0, 0, 2)]);
    }

    #[test]
    fn test_parse_pads_missing_fields() {
        let expr = parse("30 2").unwrap();
        assert_eq!(expr.minutes.items(), &[item(0, 30, 30)]);
        assert_eq!(expr.hours.items(), &[item(0, 2, 2)]);
        assert_eq!(expr.days_of_month.items(), &[item(1, 1, 31)]);
        assert_eq!(expr.months.items(), &[item(1, 1, 12)]);
        assert_eq!(expr.days_of_week.items(), &[item(1, 0, 6)]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(parse("@daily").unwrap(), parse("0 0 * * *").unwrap());
        assert_eq!(parse("@midnight").unwrap(), parse("0 0 * * *").unwrap());
        assert_eq!(parse("@hourly").unwrap(), parse("0 * * * *").unwrap());
        assert_eq!(parse("@weekly").unwrap(), parse("0 0 * * 0").unwrap());
        assert_eq!(parse("@annually").unwrap(), parse("0 0 1 1 *").unwrap());
        assert_eq!(parse("@monthly").unwrap(), parse("0 0 1 * *").unwrap());
    }

    #[test]
    fn test_parse_names_case_insensitive() {
        assert_eq!(parse("0 0 * JAN-Mar Mon").unwrap(), parse("0 0 * 1-3 1").unwrap());
        assert_eq!(parse("0 0 * december saturday").unwrap(), parse("0 0 * 12 6").unwrap());
    }

    #[test]
    fn test_weekday_wraps_but_others_do_not() {
        assert_eq!(parse("0 0 * * 7").unwrap(), parse("0 0 * * 0").unwrap());
        assert_eq!(parse("0 0 * * 8").unwrap(), parse("0 0 * * 1").unwrap());
        assert!(parse("0 0 32 * *").is_err());
        assert!(parse("0 0 0 * *").is_err());
        assert!(parse("0 0 * 13 *").is_err());
        assert!(parse("0 24 * * *").is_err());
        assert!(parse("60 * * * *").is_err());
    }

    #[test]
    fn test_parse_errors_name_field_and_token() {
        match parse("0 0 * * * *") {
            Err(JobsError::InvalidCron { message, .. }) => assert!(message.contains("at most 5")),
            other => panic!("unexpected: {other:?}"),
        }
        match parse("0 x * * *") {
            Err(JobsError::InvalidCron { expr, message }) => {
                assert_eq!(expr, "0 x * * *");
                assert!(message.contains("hours"));
                assert!(message.contains("'x'"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match parse("10-5 * * * *") {
            Err(JobsError::InvalidCron { message, .. }) => assert!(message.contains("10-5")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse("*/0 * * * *").is_err());
        assert!(parse("1,,2 * * * *").is_err());
        assert!(parse("/5 * * * *").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let expr = parse("5,3-27/4 */6 1 * mon-fri").unwrap();
        assert_eq!(expr.to_string(), "5,3-27/4 0-23/6 1 1-12/1 1-5");
        assert_eq!(parse(&expr.to_string()).unwrap(), expr);
    }
}
