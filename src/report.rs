use std::fmt::Write;

use crate::models::{ClassStatistics, Incident, SafetyProfile, TeacherDashboard};

pub fn build_report(dashboard: &TeacherDashboard) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Classroom Safety Report");
    let _ = writeln!(
        output,
        "Classroom {} (last {} days)",
        dashboard.classroom_id, dashboard.statistics.window_days
    );
    let _ = writeln!(output);

    write_statistics(&mut output, &dashboard.statistics);
    write_high_risk(&mut output, &dashboard.high_risk_students);
    write_incidents(&mut output, "Pending Incidents", &dashboard.pending_incidents);
    write_incidents(&mut output, "Recent Incidents", &dashboard.recent_incidents);

    output
}

fn write_statistics(output: &mut String, stats: &ClassStatistics) {
    let _ = writeln!(output, "## Incident Mix");
    if stats.total_incidents == 0 {
        let _ = writeln!(output, "No incidents recorded for this window.");
        let _ = writeln!(output);
        return;
    }

    let _ = writeln!(
        output,
        "{} incidents across {} students, {:.0}% resolved",
        stats.total_incidents,
        stats.distinct_students,
        stats.resolved_rate * 100.0
    );
    for (incident_type, count) in &stats.by_type {
        let _ = writeln!(output, "- {incident_type}: {count}");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "By severity:");
    for (severity, count) in &stats.by_severity {
        let _ = writeln!(output, "- {severity}: {count}");
    }
    let _ = writeln!(output);
}

fn write_high_risk(output: &mut String, profiles: &[SafetyProfile]) {
    let _ = writeln!(output, "## High-Risk Students");
    if profiles.is_empty() {
        let _ = writeln!(output, "No students currently at high risk.");
    } else {
        for profile in profiles {
            let _ = writeln!(
                output,
                "- {}: victim risk {}, offender risk {}, {} incidents{}",
                profile.student_id,
                profile.victim_risk.as_str(),
                profile.offender_risk.as_str(),
                profile.incident_count,
                if profile.action_required {
                    " (action required)"
                } else {
                    ""
                }
            );
        }
    }
    let _ = writeln!(output);
}

fn write_incidents(output: &mut String, heading: &str, incidents: &[Incident]) {
    let _ = writeln!(output, "## {heading}");
    if incidents.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for incident in incidents {
            let _ = writeln!(
                output,
                "- [{}] {} ({}) on {}: {}",
                incident.severity,
                incident.incident_type.as_str(),
                incident.status.as_str(),
                incident.created_at.format("%Y-%m-%d %H:%M"),
                incident.description
            );
        }
    }
    let _ = writeln!(output);
}
