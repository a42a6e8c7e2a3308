//! Message bodies for each notification kind. Every provider or user string that ends
//! up in HTML goes through `encode_text`.

use html_escape::encode_text;

use super::{NotificationKind, NotificationPayload};
use crate::model::{AggregatedResult, NormalizedFlight};
use crate::monitor::MonitorTask;

const LISTED_FLIGHTS: usize = 5;

fn describe(f: &NormalizedFlight) -> String {
    let numbers: Vec<String> = f
        .legs
        .iter()
        .map(|l| format!("{}{}", l.carrier, l.flight_number))
        .collect();
    let departs = f
        .departs_at()
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let stops = match f.stops {
        0 => "direct".to_string(),
        1 => "1 stop".to_string(),
        n => format!("{n} stops"),
    };
    format!(
        "{} {} | {} | {} | {:.0} {}",
        f.route(),
        numbers.join("/"),
        departs,
        stops,
        f.price,
        f.currency
    )
}

pub fn price_drop(task: &MonitorTask, result: &AggregatedResult, price: f64) -> NotificationPayload {
    let q = &task.query;
    let route = format!("{} → {}", q.origin(), q.destination());
    let subject = format!(
        "Price alert: {route} on {} now {price:.0} {}",
        q.depart_date(),
        q.currency()
    );
    let listed: Vec<&NormalizedFlight> = result.flights.iter().take(LISTED_FLIGHTS).collect();
    let more = result.flights.len().saturating_sub(listed.len());

    let mut text = format!(
        "{route} on {} dropped to {price:.0} {} (your threshold: {:.0}).\n\n",
        q.depart_date(),
        q.currency(),
        task.price_threshold
    );
    for (i, f) in listed.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, describe(f)));
        if let Some(h) = &f.hidden_destination {
            text.push_str(&format!("   hidden-city ticket to {h}\n"));
        }
    }
    if more > 0 {
        text.push_str(&format!("... and {more} more options\n"));
    }

    let mut html = format!(
        "<h3>{}</h3><p>Now <b>{price:.0} {}</b> (threshold {:.0}) for {}.</p><ol>",
        encode_text(&route),
        encode_text(q.currency()),
        task.price_threshold,
        q.depart_date()
    );
    for f in &listed {
        html.push_str(&format!("<li>{}", encode_text(&describe(f))));
        if let Some(h) = &f.hidden_destination {
            html.push_str(&format!(" <i>(hidden-city to {})</i>", encode_text(h)));
        }
        html.push_str("</li>");
    }
    html.push_str("</ol>");
    if more > 0 {
        html.push_str(&format!("<p>… and {more} more options</p>"));
    }

    NotificationPayload {
        kind: NotificationKind::PriceDrop,
        subject,
        text,
        html,
    }
}

pub fn degraded(task: &MonitorTask, failures: u32, last_error: &str) -> NotificationPayload {
    let q = &task.query;
    let route = format!("{} → {}", q.origin(), q.destination());
    let subject = format!("Price monitor paused: {route} on {}", q.depart_date());
    let text = format!(
        "Your price monitor #{} for {route} on {} was paused after {failures} consecutive failed checks.\n\
         Last error: {last_error}\nReactivate it once you want checks to resume.\n",
        task.id,
        q.depart_date()
    );
    let html = format!(
        "<p>Your price monitor #{} for <b>{}</b> on {} was paused after {failures} consecutive failed checks.</p>\
         <p>Last error: <code>{}</code></p><p>Reactivate it once you want checks to resume.</p>",
        task.id,
        encode_text(&route),
        q.depart_date(),
        encode_text(last_error)
    );
    NotificationPayload {
        kind: NotificationKind::MonitorDegraded,
        subject,
        text,
        html,
    }
}
