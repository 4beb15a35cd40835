//! Probe command: fetch and parse a single identifier end to end
//!
//! Diagnostic for verifying that the registry is reachable, the active
//! fetch path is not being blocked, and the parser still matches the
//! live page markup. Does not touch the checkpoint or output files.

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::Config;
use crate::fetch::create_fetcher;
use crate::record::RecordParser;

pub async fn probe_identifier(config: Config, reg_id: String) -> Result<()> {
    let reg_id = reg_id.to_uppercase();
    let id_format = Regex::new(r"^[A-Z]{3}\d{10,}$").context("compiling identifier pattern")?;
    if !id_format.is_match(&reg_id) {
        bail!(
            "'{}' is not a registration identifier (expected 3 letters + 10 or more digits)",
            reg_id
        );
    }

    let mut fetcher = create_fetcher(&config).context("building detail fetcher")?;
    println!("Fetching {} via the {} path...", reg_id, fetcher.name());

    let html = fetcher
        .fetch(&reg_id)
        .await
        .with_context(|| format!("fetching {}", reg_id))?;
    println!("Received {} bytes", html.len());

    let parser = RecordParser::new().context("building record parser")?;
    let record = parser
        .parse(&html)
        .with_context(|| format!("parsing detail page for {}", reg_id))?;

    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    println!("\nParsed Record");
    println!("=============");
    println!("Name:                {}", show(&record.name));
    println!("Title:               {}", show(&record.name_title));
    println!("First name:          {}", show(&record.first_name));
    println!("Middle name:         {}", show(&record.middle_name));
    println!("Last name:           {}", show(&record.last_name));
    println!("Registration ID:     {}", record.reg_id);
    println!("Profession:          {}", show(&record.profession));
    println!("Status:              {}", show(&record.registration_status));
    println!("First registered:    {}", show(&record.first_reg_date));
    println!("Expiry:              {}", show(&record.reg_expiry));
    println!("Endorsement:         {}", show(&record.endorsement));
    println!("Sex:                 {}", show(&record.sex));
    println!("Suburb:              {}", show(&record.suburb));
    println!("State:               {}", show(&record.state));
    println!("Postcode:            {}", show(&record.postcode));
    println!("Divisions:           {}", show(&record.divisions));
    Ok(())
}
