use certree::{
    BatchOptions, DistinguishedName, HierarchyIndex, KeySpec, Lifecycle, NodeRecord, RcgenEngine,
    RevocationReason, SubjectAltName,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut pki = match std::fs::read_to_string("branch-pki.json") {
        Ok(blob) => {
            println!("Restoring hierarchy from branch-pki.json");
            HierarchyIndex::restore(&blob)?
        }
        Err(_) => {
            println!("Creating a new hierarchy");
            let mut pki = HierarchyIndex::with_id("branch-pki");
            pki.insert(
                NodeRecord::authority("root")
                    .with_path_limit(2)
                    .with_key(KeySpec::EcdsaP384)
                    .with_subject(DistinguishedName::new("Example Root CA").with_country("US"))
                    .with_life(3650)
                    .with_crl_life(30),
            )?;
            pki.insert(
                NodeRecord::authority("issuing")
                    .issued_by("root")
                    .with_key(KeySpec::EcdsaP256)
                    .with_subject(DistinguishedName::new("Example Issuing CA"))
                    .with_life(1825)
                    .with_crl_life(7)
                    .with_crl_distribution_points("http://crl.example.com/issuing.crl"),
            )?;
            pki.insert(
                NodeRecord::end_entity("api")
                    .issued_by("issuing")
                    .with_key(KeySpec::EcdsaP256)
                    .with_subject(DistinguishedName::new("api.example.com"))
                    .with_san(SubjectAltName::parse("dns=api.example.com, dns=www.example.com"))
                    .with_life(90),
            )?;
            pki
        }
    };

    // Artifacts live in memory, so a restored hierarchy is regenerated from scratch.
    let engine = RcgenEngine::default();
    let lifecycle = Lifecycle::new(&engine);
    for id in pki.list_ids() {
        lifecycle.set_status(&mut pki, &id, certree::Status::AwaitingKey)?;
    }

    let report = lifecycle.batch_generate(&mut pki, &BatchOptions::default().with_bundles(true))?;
    println!("Initial generation: {} steps", report.completed.len());

    println!("\nRenewing everything below the issuing CA...");
    let report = lifecycle.renew_branch(
        &mut pki,
        "issuing",
        RevocationReason::Superseded,
        false,
        &BatchOptions::default(),
    )?;
    if !report.is_success() {
        for failure in &report.failures {
            eprintln!("  {} failed on {}: {}", failure.node, failure.step, failure.error);
        }
    }

    println!("Renewing the issuing CA revocation list with a 3 day life...");
    let list = lifecycle.renew_revocation_list(&mut pki, "issuing", Some(3))?;
    engine.save_artifact(&list, "issuing.crl.pem")?;

    if let Some(bundle) = pki.get("api").and_then(|n| n.artifacts().bundle.clone()) {
        engine.save_artifact(&bundle, "api.p12")?;
        println!("Renewed bundle written to api.p12");
    }

    std::fs::write("branch-pki.json", pki.serialize()?)?;
    println!("Snapshot written to branch-pki.json");
    Ok(())
}
