//! Run report: counts, timings, and resource usage in text or JSON.

use serde::Serialize;

use crate::logger::{PhaseDelta, ResultLog};
use crate::sched::SchedStats;
use crate::transaction::Utility;

#[derive(Clone, Debug, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub wall_ms: u64,
    pub user_ms: u64,
    pub sys_ms: u64,
    pub max_rss_mb: u64,
}

impl From<&PhaseDelta> for PhaseReport {
    fn from(d: &PhaseDelta) -> Self {
        Self {
            name: d.name.to_string(),
            wall_ms: d.wall.as_millis() as u64,
            user_ms: d.user.as_millis() as u64,
            sys_ms: d.sys.as_millis() as u64,
            max_rss_mb: d.max_rss_bytes / (1024 * 1024),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub min_util: Utility,
    pub hui_count: u64,
    pub candidate_count: u64,
    pub threads: usize,
    pub tasks_executed: u64,
    pub steals: u64,
    pub total_ms: u64,
    pub cpu_ms: u64,
    pub cpu_usage: f64,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn build(
        log: &ResultLog,
        stats: SchedStats,
        min_util: Utility,
        threads: usize,
    ) -> Self {
        let phases: Vec<PhaseReport> = log.phase_deltas().iter().map(PhaseReport::from).collect();
        let total_ms = log.total_time().as_millis() as u64;
        let cpu_ms: u64 = phases.iter().map(|p| p.user_ms + p.sys_ms).sum();
        Self {
            min_util,
            hui_count: log.hui_count(),
            candidate_count: log.candidate_count(),
            threads,
            tasks_executed: stats.tasks_executed,
            steals: stats.steals,
            total_ms,
            cpu_ms,
            cpu_usage: if total_ms > 0 {
                cpu_ms as f64 / total_ms as f64
            } else {
                0.0
            },
            phases,
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("============= RESULT ===============\n");
        out.push_str(&format!("minUtil = {}\n", self.min_util));
        out.push_str(&format!("High utility itemsets count: {}\n", self.hui_count));
        out.push_str(&format!("Candidate count: {}\n", self.candidate_count));
        out.push_str(&format!("# of threads: {}\n", self.threads));
        out.push_str(&format!(
            "Tasks executed: {} ({} stolen)\n",
            self.tasks_executed, self.steals
        ));
        out.push_str(&format!("Total time ~: {} ms\n", self.total_ms));
        out.push_str(&format!("CPU time ~: {} ms\n", self.cpu_ms));
        out.push_str(&format!("CPU usage ~: {:.2}\n", self.cpu_usage));
        out.push_str("=========== STATISTICS =============\n");
        let name_w = self
            .phases
            .iter()
            .map(|p| p.name.len())
            .max()
            .unwrap_or(4)
            .max(5);
        out.push_str(&format!(
            "{:name_w$} {:>9} {:>9} {:>9} {:>8}\n",
            "phase", "wall", "usr", "sys", "RSS"
        ));
        for p in &self.phases {
            out.push_str(&format!(
                "{:name_w$} {:>6} ms {:>6} ms {:>6} ms {:>5} MB\n",
                p.name, p.wall_ms, p.user_ms, p.sys_ms, p.max_rss_mb
            ));
        }
        out.push_str("====================================\n");
        out
    }

    pub fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunReport {
        RunReport {
            min_util: 40,
            hui_count: 5,
            candidate_count: 12,
            threads: 4,
            tasks_executed: 20,
            steals: 3,
            total_ms: 100,
            cpu_ms: 180,
            cpu_usage: 1.8,
            phases: vec![PhaseReport {
                name: "parse".into(),
                wall_ms: 10,
                user_ms: 8,
                sys_ms: 2,
                max_rss_mb: 12,
            }],
        }
    }

    #[test]
    fn text_report_names_the_key_figures() {
        let text = sample().render_text();
        assert!(text.contains("minUtil = 40"));
        assert!(text.contains("High utility itemsets count: 5"));
        assert!(text.contains("parse"));
    }

    #[test]
    fn json_report_round_trips() {
        let json = sample().render_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["hui_count"], 5);
        assert_eq!(value["phases"][0]["name"], "parse");
    }
}
