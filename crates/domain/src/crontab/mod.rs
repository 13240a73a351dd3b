//! crontab 表达式引擎
//!
//! 解析5字段的 crontab 字符串，判断某个时刻是否满足表达式，并在给定时刻前后
//! 双向搜索最近的满足条件的整分钟。

mod parsing;

pub use parsing::parse;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike};
use jobs_core::JobsError;

/// 无边界搜索时最多跨越的天数，保证永不满足的表达式（如 `0 0 31 2 *`）也能结束
pub const MAX_SEARCH_DAYS: u32 = 366 * 124;

/// 字段中的一项：`from`..=`through` 之间、自 `from` 起每 `every_nth` 个取一个
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldItem {
    pub every_nth: u32,
    pub from: u32,
    pub through: u32,
}

impl FieldItem {
    pub fn accepts(&self, n: u32) -> bool {
        n >= self.from
            && n <= self.through
            && (self.every_nth == 0 || (n - self.from) % self.every_nth == 0)
    }
}

impl fmt::Display for FieldItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.through {
            write!(f, "{}", self.from)?;
        } else {
            write!(f, "{}-{}", self.from, self.through)?;
        }
        if self.every_nth > 0 {
            write!(f, "/{}", self.every_nth)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    items: Vec<FieldItem>,
    /// 是否覆盖了整个取值范围
    unrestricted: bool,
}

impl Field {
    fn new(items: Vec<FieldItem>, min: u32, max: u32) -> Self {
        let unrestricted = (min..=max).all(|n| items.iter().any(|item| item.accepts(n)));
        Self {
            items,
            unrestricted,
        }
    }

    pub fn items(&self) -> &[FieldItem] {
        &self.items
    }

    pub fn accepts(&self, n: u32) -> bool {
        self.items.iter().any(|item| item.accepts(n))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, item) in self.items.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

/// 解析后的 crontab 表达式，通过 [`parse`] 或 `str::parse` 获得
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrontabExpr {
    pub minutes: Field,
    pub hours: Field,
    pub days_of_month: Field,
    pub months: Field,
    pub days_of_week: Field,
}

impl CrontabExpr {
    fn new(
        minutes: Field,
        hours: Field,
        days_of_month: Field,
        months: Field,
        days_of_week: Field,
    ) -> Self {
        Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        }
    }

    /// 日期部分是否满足：月份必须匹配；日与星期两者都受限时任一匹配即可
    pub fn date_ok<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        if !self.months.accepts(t.month()) {
            return false;
        }
        let day_ok = self.days_of_month.accepts(t.day());
        let weekday_ok = self
            .days_of_week
            .accepts(t.weekday().num_days_from_sunday());
        if self.days_of_month.is_unrestricted() || self.days_of_week.is_unrestricted() {
            day_ok && weekday_ok
        } else {
            day_ok || weekday_ok
        }
    }

    pub fn time_ok<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.hours.accepts(t.hour()) && self.minutes.accepts(t.minute())
    }

    pub fn date_and_time_ok<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.date_ok(t) && self.time_ok(t)
    }

    /// 从 `now` 出发分别向过去和未来搜索最近的满足条件的整分钟。
    ///
    /// 可选的 `after`/`before` 为排他边界，返回值严格位于两者之间。所有返回值
    /// 都换算到 `now` 的时区。
    pub fn soonest_to<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        after: Option<&DateTime<Tz>>,
        before: Option<&DateTime<Tz>>,
    ) -> (Option<DateTime<Tz>>, Option<DateTime<Tz>>) {
        let tz = now.timezone();
        let now = truncate_to_minute(now);
        let after = after.map(|t| truncate_to_minute(&t.with_timezone(&tz)));
        let before = before.map(|t| truncate_to_minute(&t.with_timezone(&tz)));

        let past = self.search(&now, false, after.as_ref(), before.as_ref());
        let future = self.search(&now, true, after.as_ref(), before.as_ref());
        (past, future)
    }

    fn search<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        forward: bool,
        after: Option<&DateTime<Tz>>,
        before: Option<&DateTime<Tz>>,
    ) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let step = if forward {
            Duration::minutes(1)
        } else {
            Duration::minutes(-1)
        };
        let mut t = now.clone();
        let mut day = t.date_naive();
        let mut days_visited = 0u32;

        loop {
            if let Some(after) = after {
                if t <= *after {
                    if !forward {
                        return None;
                    }
                    t = after.clone() + Duration::minutes(1);
                    continue;
                }
            }
            if let Some(before) = before {
                if t >= *before {
                    if forward {
                        return None;
                    }
                    t = before.clone() - Duration::minutes(1);
                    continue;
                }
            }

            if t.date_naive() != day {
                day = t.date_naive();
                days_visited += 1;
                if days_visited > MAX_SEARCH_DAYS {
                    return None;
                }
            }

            if !self.date_ok(&t) {
                // 整天跳过：前进时落在次日 00:00，后退时落在前一日 23:59
                let next_day = if forward {
                    day.succ_opt()?
                } else {
                    day.pred_opt()?
                };
                t = day_edge(&tz, next_day, forward)?;
                continue;
            }
            if self.time_ok(&t) {
                return Some(t);
            }
            t = t + step;
        }
    }
}

impl FromStr for CrontabExpr {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for CrontabExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minutes, self.hours, self.days_of_month, self.months, self.days_of_week
        )
    }
}

fn truncate_to_minute<Tz: TimeZone>(t: &DateTime<Tz>) -> DateTime<Tz> {
    t.clone()
        - Duration::seconds(i64::from(t.second()))
        - Duration::nanoseconds(i64::from(t.nanosecond()))
}

fn day_edge<Tz: TimeZone>(tz: &Tz, day: NaiveDate, forward: bool) -> Option<DateTime<Tz>> {
    let (edge, fallback) = if forward {
        (day.and_hms_opt(0, 0, 0)?, day.and_hms_opt(1, 0, 0)?)
    } else {
        (day.and_hms_opt(23, 59, 0)?, day.and_hms_opt(22, 59, 0)?)
    };
    let local = tz.from_local_datetime(&edge);
    let found = if forward {
        local.earliest()
    } else {
        local.latest()
    };
    found.or_else(|| tz.from_local_datetime(&fallback).earliest())
}
