use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use colored::Colorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::cli::{import, open_session, reconcile};
use crate::error::Result;
use crate::fmt::money;
use crate::importer::import_file;
use crate::layout::{bank_return, render};
use crate::models::Competence;
use crate::permissions::Capability;
use crate::reconciler;
use crate::text::to_bank_ascii;

const BENEFICIARIES: usize = 30;

const FIRST_NAMES: &[&str] = &[
    "João", "Maria", "José", "Ana", "Antônio", "Francisca", "Luís", "Márcia", "Sebastião", "Conceição",
    "Raimundo", "Cláudia", "Benedito", "Lúcia", "Joaquim", "Fátima",
];

const LAST_NAMES: &[&str] = &[
    "da Silva", "dos Santos", "Conceição", "Araújo", "Gonçalves", "Ribeiro", "de Souza", "Magalhães",
    "Simões", "Brandão", "Assunção", "Pereira",
];

const PROJECTS: &[&str] = &["Frente Leste", "Frente Centro", "Capacitação"];

struct Beneficiary {
    cpf: String,
    card: String,
    name: String,
    amount: Decimal,
    project: &'static str,
}

fn digits(rng: &mut StdRng, n: usize) -> String {
    let first = rng.gen_range(1..=9u8);
    let mut s = first.to_string();
    for _ in 1..n {
        s.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    s
}

fn beneficiaries(rng: &mut StdRng) -> Vec<Beneficiary> {
    (0..BENEFICIARIES)
        .map(|_| {
            let name = format!(
                "{} {}",
                FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())],
                LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())]
            );
            Beneficiary {
                cpf: digits(rng, 11),
                card: digits(rng, 10),
                name,
                amount: Decimal::new([60000, 80000, 120000][rng.gen_range(0..3)], 2),
                project: PROJECTS[rng.gen_range(0..PROJECTS.len())],
            }
        })
        .collect()
}

fn masked_cpf(cpf: &str) -> String {
    format!("{}.{}.{}-{}", &cpf[..3], &cpf[3..6], &cpf[6..9], &cpf[9..])
}

/// A payroll sheet with the usual defects: a paid-twice row, a renamed
/// beneficiary, a row without cpf, a blank line and a totals footer.
fn payroll_csv(people: &[Beneficiary]) -> String {
    let mut out = String::from("CPF;Nome do Beneficiário;Número do Cartão;Valor Pago;Projeto\n");
    let mut total = Decimal::ZERO;
    for (i, b) in people.iter().enumerate() {
        let cpf = if i % 3 == 0 { masked_cpf(&b.cpf) } else { b.cpf.clone() };
        out.push_str(&format!("{cpf};{};{};{};{}\n", b.name, b.card, money(b.amount), b.project));
        total += b.amount;
    }
    let twice = &people[0];
    out.push_str(&format!(
        "{};{};{};{};{}\n",
        twice.cpf,
        twice.name,
        twice.card,
        money(twice.amount),
        twice.project
    ));
    let renamed = &people[1];
    out.push_str(&format!(
        "{};{} Filho;{};{};{}\n",
        renamed.cpf,
        renamed.name,
        renamed.card,
        money(Decimal::new(20000, 2)),
        renamed.project
    ));
    out.push_str(&format!(";Beneficiário Sem Documento;5550001112;{};Capacitação\n", money(Decimal::new(60000, 2))));
    out.push_str(";;;;\n");
    out.push_str(&format!("TOTAL;;;{};\n", money(total)));
    out
}

/// A bank return that leaves out the last beneficiary, spells one name
/// differently, carries one unknown cpf and one truncated line.
fn bank_return_file(people: &[Beneficiary], rng: &mut StdRng) -> Result<String> {
    let mut lines = vec![format!("{:<100}", "0RETORNO POT")];
    for (i, b) in people.iter().enumerate().take(people.len() - 1) {
        let name = if i == 3 {
            to_bank_ascii(&format!("{} Junior", b.name))
        } else {
            to_bank_ascii(&b.name)
        };
        lines.push(render(bank_return::DETAIL, &["1", &b.cpf, &name, &b.card, "00"])?);
    }
    let stranger = digits(rng, 11);
    lines.push(render(
        bank_return::DETAIL,
        &["1", &stranger, "PESSOA NAO CADASTRADA", &digits(rng, 10), "00"],
    )?);
    lines.push(format!("1{}TRUNCADO", &people[2].cpf));
    lines.push(format!("9{:0>6}{:<93}", lines.len() - 1, ""));
    Ok(lines.join("\r\n") + "\r\n")
}

fn write_demo_files(dir: &Path, competence: Competence) -> Result<(PathBuf, PathBuf)> {
    let seed = u64::from(competence.month) + 100 * competence.year as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    let people = beneficiaries(&mut rng);

    std::fs::create_dir_all(dir)?;
    let sheet = dir.join(format!("folha-{}.csv", competence.packed()));
    let bank = dir.join(format!("retorno-{}.txt", competence.packed()));
    std::fs::write(&sheet, payroll_csv(&people))?;
    std::fs::write(&bank, bank_return_file(&people, &mut rng)?)?;
    Ok((sheet, bank))
}

fn previous_month() -> Result<Competence> {
    let today = Local::now().date_naive();
    if today.month() == 1 {
        Competence::new(12, today.year() - 1)
    } else {
        Competence::new(today.month() - 1, today.year())
    }
}

pub fn run(user: Option<&str>) -> Result<()> {
    let session = open_session(user)?;
    let conn = &session.conn;
    session.actor.require(conn, Capability::Import, "demo")?;
    session.actor.require(conn, Capability::Reconcile, "demo")?;

    let competence = previous_month()?;
    let (sheet, bank) = write_demo_files(&session.data_dir.join("demo"), competence)?;
    println!("Demo files written for {competence}:");
    println!("  {}", sheet.display());
    println!("  {}", bank.display());

    let imported = import_file(conn, &sheet, Some(competence), &session.actor.name, &session.settings)?;
    if imported.duplicate_file {
        println!("Demo data already loaded for {competence}.");
        return Ok(());
    }
    println!();
    println!("{}", import::format_result(&imported));

    let result = reconciler::reconcile(conn, &bank, competence, &session.actor.name)?;
    println!();
    println!("{}", reconcile::format_result(&result, competence));
    println!();
    println!("{}", "Demo data loaded!".green().bold());
    println!(
        "Try `malha report summary --competence {}-{:02}`.",
        competence.year, competence.month
    );
    Ok(())
}
