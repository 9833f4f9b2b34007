//! `list` command handler.

use serde::Serialize;

use ngx_scaffold_core::{ParseOptions, Strictness, Suite};

use crate::cli::args::{ListArgs, OutputFormat};
use crate::cli::commands::expand_paths;
use crate::error::ScaffoldError;
use crate::runner::load_suite;

#[derive(Debug, Serialize, PartialEq, Eq)]
struct BlockListing {
    ordinal: usize,
    title: String,
    line: usize,
    sections: Vec<String>,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct SuiteListing {
    file: String,
    blocks: Vec<BlockListing>,
}

/// Lists the blocks of each suite.
///
/// Unknown sections are listed as written.
///
/// # Errors
///
/// Returns an I/O error if a file cannot be read, or the first parse error.
pub fn run(args: &ListArgs) -> Result<(), ScaffoldError> {
    let options = ParseOptions {
        strictness: Strictness::Lenient,
        ..ParseOptions::default()
    };
    let mut listings = Vec::new();
    for path in expand_paths(&args.paths)? {
        let output = load_suite(&path, &options)?;
        listings.push(SuiteListing {
            file: path.display().to_string(),
            blocks: describe(&output.suite),
        });
    }

    match args.format {
        OutputFormat::Human => {
            for listing in &listings {
                println!("{}", listing.file);
                for block in &listing.blocks {
                    let marker = if block.selected { ' ' } else { '-' };
                    println!(
                        "  {marker}{:>3}  {}  [{}]",
                        block.ordinal,
                        block.title,
                        block.sections.join(", ")
                    );
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listings)?),
    }
    Ok(())
}

fn describe(suite: &Suite) -> Vec<BlockListing> {
    let selected: Vec<usize> = suite.selected().iter().map(|b| b.ordinal()).collect();
    suite
        .blocks
        .iter()
        .map(|block| BlockListing {
            ordinal: block.ordinal(),
            title: block.display_name(),
            line: block.line(),
            sections: block.entries().iter().map(|e| e.name.clone()).collect(),
            selected: selected.contains(&block.ordinal()),
        })
        .collect()
}
