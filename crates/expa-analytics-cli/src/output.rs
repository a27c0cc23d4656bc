use colored::Colorize;
use expa_analytics::{FlushOutcome, RequestSignal};

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_signal(signal: &RequestSignal) {
    let request = signal.request();
    let id = request.request_id.to_string();
    match signal {
        RequestSignal::DidSendRequest { .. } => {
            println!(
                "{} {} ({} event(s) → {}) [{}]",
                "→".cyan(),
                signal.name(),
                request.batch_size,
                request.url,
                &id[..8]
            );
        }
        RequestSignal::RequestDidSucceed { status, .. } => {
            println!("{} {} HTTP {} [{}]", "✓".green(), signal.name(), status, &id[..8]);
        }
        RequestSignal::RequestDidFail {
            error, retained, ..
        } => {
            let fate = if *retained { "kept for retry" } else { "dropped" };
            println!(
                "{} {} {} ({}) [{}]",
                "✗".red(),
                signal.name(),
                error,
                fate.yellow(),
                &id[..8]
            );
        }
    }
}

pub fn print_outcome(outcome: &FlushOutcome, remaining: usize) {
    match outcome {
        FlushOutcome::Empty => println!("Nothing to flush."),
        FlushOutcome::InFlight => println!("A flush is already in progress."),
        FlushOutcome::Deferred => println!("Flush deferred by retry backoff."),
        FlushOutcome::Completed(report) if report.is_success() => {
            print_success(&format!(
                "Delivered {} event(s) in {} request(s)",
                report.delivered, report.requests
            ));
        }
        FlushOutcome::Completed(report) => {
            print_error(&format!(
                "Delivered {}, dropped {}, {} still queued{}",
                report.delivered,
                report.dropped,
                remaining,
                report
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ));
        }
    }
}
