use std::collections::BTreeSet;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::analytics::{self, Window};
use crate::models::{Child, HeatmapCell, PracticeAttempt};
use crate::recommend;

fn weakest_cells(cells: &[HeatmapCell], limit: usize) -> Vec<&HeatmapCell> {
    let mut sorted: Vec<&HeatmapCell> = cells.iter().collect();
    sorted.sort_by(|a, b| {
        a.accuracy
            .total_cmp(&b.accuracy)
            .then_with(|| a.topic.cmp(&b.topic))
    });
    sorted.into_iter().take(limit).collect()
}

pub fn build_report(
    child: &Child,
    window: &Window,
    attempts: &[PracticeAttempt],
    history: &BTreeSet<NaiveDate>,
    curriculum_topics: usize,
) -> String {
    let summary = analytics::comprehensive(attempts, window, history);
    let readiness = analytics::readiness(attempts, window, curriculum_topics);
    let heatmap = analytics::heatmap(attempts, window);
    let health = analytics::learning_health(attempts, window);
    let recommendations = recommend::synthesize(&heatmap.cells, summary.streak_days, summary.accuracy);

    let mut output = String::new();

    let _ = writeln!(output, "# Progress Report: {}", child.name);
    let _ = writeln!(
        output,
        "Year {} ({} exam), last {} days to {}",
        child.year_group,
        child.exam_type.as_str().to_uppercase(),
        window.days,
        window.now.date_naive()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Readiness");

    if !readiness.has_data {
        let _ = writeln!(output, "No practice recorded for this window.");
    } else {
        let _ = writeln!(
            output,
            "Score {}/100 ({}, {:?} confidence) from {} answers",
            readiness.overall_score,
            readiness.tier.label(),
            readiness.confidence,
            readiness.attempts_counted
        );
        let components = &readiness.components;
        for (name, part) in [
            ("Accuracy", components.accuracy),
            ("Coverage", components.coverage),
            ("Consistency", components.consistency),
            ("Difficulty", components.difficulty),
            ("Improvement", components.improvement),
        ] {
            let _ = writeln!(output, "- {name}: {:.1} / {:.0}", part.score, part.max);
        }
        if let Some(trend) = readiness.trend {
            let _ = writeln!(
                output,
                "- Change since previous period: {:+} (was {})",
                trend.delta, trend.previous_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Practice");
    let _ = writeln!(
        output,
        "{} questions, {:.1}% correct, {} active days, {}-day streak",
        summary.total_attempts, summary.accuracy, summary.active_days, summary.streak_days
    );
    for subject in &summary.subjects {
        let _ = writeln!(
            output,
            "- {}: {:.1}% across {} questions",
            subject.subject, subject.accuracy, subject.attempts
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weakest Topics");

    if heatmap.cells.is_empty() {
        let _ = writeln!(output, "No topics practised in this window.");
    } else {
        for cell in weakest_cells(&heatmap.cells, 5) {
            let _ = writeln!(
                output,
                "- {} / {}: {:.1}% ({}, trend {:?})",
                cell.subject,
                cell.topic,
                cell.accuracy,
                cell.mastery_level.label(),
                cell.trend
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Learning Health");
    let _ = writeln!(
        output,
        "- Rushing: {:.1}% of answers under {}s ({})",
        health.rush_factor.percentage,
        health.rush_factor.threshold_seconds,
        health.rush_factor.level.label()
    );
    let _ = writeln!(
        output,
        "- Fatigue: {:.1} point drop across {} sessions ({})",
        health.fatigue.drop_points,
        health.fatigue.sessions_measured,
        health.fatigue.level.label()
    );
    let _ = writeln!(
        output,
        "- Stagnant topics: {} ({})",
        health.stagnant_topics.count,
        health.stagnant_topics.level.label()
    );
    for topic in &health.stagnant_topics.topics {
        let _ = writeln!(
            output,
            "  - {} / {}: {:.1}% then {:.1}%",
            topic.subject, topic.topic, topic.previous_accuracy, topic.recent_accuracy
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");

    if recommendations.is_empty() {
        let _ = writeln!(output, "Nothing to flag. Keep going!");
    } else {
        for recommendation in &recommendations {
            let _ = writeln!(
                output,
                "- [{:?}] {}",
                recommendation.priority, recommendation.message
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::analytics::tests::{attempt, fixed_now};
    use crate::models::ExamType;

    fn child() -> Child {
        Child {
            id: Uuid::new_v4(),
            parent_id: Uuid::new_v4(),
            name: "Arjun".into(),
            year_group: 5,
            exam_type: ExamType::Gl,
            avatar: None,
            is_active: true,
            created_at: fixed_now() - Duration::days(100),
        }
    }

    #[test]
    fn empty_window_reports_no_data() {
        let report = build_report(&child(), &Window::new(fixed_now(), 30), &[], &BTreeSet::new(), 10);
        assert!(report.starts_with("# Progress Report: Arjun"));
        assert!(report.contains("No practice recorded for this window."));
        assert!(report.contains("No topics practised in this window."));
        assert!(report.contains("GL exam"));
    }

    #[test]
    fn weak_topics_surface_in_recommendations() {
        let mut attempts = Vec::new();
        for i in 0..10 {
            attempts.push(attempt("mathematics", "Fractions", i < 4, 5 + i));
            attempts.push(attempt("english", "Synonyms", i < 9, 30 + i));
        }
        let history = analytics::practice_days(&attempts);
        let report = build_report(&child(), &Window::new(fixed_now(), 30), &attempts, &history, 10);

        assert!(report.contains("## Weakest Topics\n- mathematics / Fractions: 40.0%"));
        assert!(report.contains("[High] Practise Fractions in Mathematics"));
        assert!(!report.contains("Practise Synonyms"));
    }
}
