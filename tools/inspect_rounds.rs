//! Print recent rounds and their wagers from a spinwheel RocksDB directory.
//!
//! Run while the server is stopped; RocksDB holds an exclusive lock.

use clap::Parser;
use spinwheel::{
    common::traits::RoundStore,
    errors::SpinwheelResult,
    games::types::{Round, RoundPhase},
    RocksStore,
};

#[derive(Parser)]
#[command(name = "inspect_rounds")]
#[command(about = "Inspect persisted spinwheel rounds")]
struct Args {
    #[arg(short, long, default_value = "./DB/spinwheel_data")]
    db_path: String,

    /// Number of most recent rounds to list
    #[arg(short, long, default_value = "10")]
    limit: usize,

    /// Show one round with all of its wagers
    #[arg(short, long)]
    round: Option<u64>,

    /// List wagers of one player instead
    #[arg(long)]
    player: Option<String>,
}

#[tokio::main]
async fn main() -> SpinwheelResult<()> {
    let args = Args::parse();
    let store = RocksStore::open(&args.db_path, false)?;

    if let Some(player) = args.player {
        let wagers = store.player_wagers(&player, args.limit).await?;
        println!("Wagers of {} ({}):", player, wagers.len());
        for w in wagers {
            println!(
                "  round {:>6}  {:<6} {:>8}  {:?}  payout {}",
                w.round_id,
                w.bet_kind.as_str(),
                w.amount,
                w.status,
                w.payout
            );
        }
        return Ok(());
    }

    if let Some(round_id) = args.round {
        match store.load_round(round_id).await? {
            Some(round) => {
                print_round(&round);
                for w in store.load_round_wagers(round_id).await? {
                    println!(
                        "    {}  {:<12} {:<6} {:>8}  {:?}  payout {}",
                        w.wager_id,
                        w.player_id,
                        w.bet_kind.as_str(),
                        w.amount,
                        w.status,
                        w.payout
                    );
                }
            }
            None => println!("Round {} not found", round_id),
        }
        return Ok(());
    }

    match store.latest_round_id().await? {
        Some(latest) => println!("Latest round: {}", latest),
        None => {
            println!("Store is empty");
            return Ok(());
        }
    }

    let open = store.unsettled_rounds().await?;
    if !open.is_empty() {
        println!(
            "Unsettled rounds (voided on next start): {:?}",
            open.iter().map(|r| r.round_id).collect::<Vec<_>>()
        );
    }

    let (rounds, next) = store.recent_rounds(None, args.limit).await?;
    println!("Most recent {} rounds:", rounds.len());
    for round in &rounds {
        print_round(round);
    }
    if next.is_some() {
        println!("  ... older rounds exist");
    }
    Ok(())
}

fn print_round(round: &Round) {
    let outcome = match (&round.outcome, round.phase) {
        (_, RoundPhase::Voided) => "voided".to_string(),
        (Some(o), _) => format!("{} ({})", o.kind.as_str(), o.sector),
        (None, phase) => format!("{}", phase),
    };
    let totals = round.aggregates.clone().unwrap_or_default();
    println!(
        "  round {:>6}  {:<12} wagers {:>4}  wagered {:>10}  paid {:>10}",
        round.round_id,
        outcome,
        totals.wager_count,
        totals.total_wagered,
        totals.total_paid
    );
}
