use certree::{
    BatchOptions, DistinguishedName, HierarchyIndex, KeySpec, Lifecycle, NodeKind, NodeRecord,
    RcgenEngine, RevocationReason,
};

fn node(id: &str, kind: NodeKind, issuer: &str) -> NodeRecord {
    NodeRecord::new(id, kind)
        .issued_by(issuer)
        .with_key(KeySpec::EcdsaP256)
        .with_subject(
            DistinguishedName::new(format!("{}.operator.com", id))
                .with_organization("Example Operator")
                .with_country("FR"),
        )
        .with_life(365)
        .with_crl_life(30)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Creating an LTE PKI...");
    let mut pki = HierarchyIndex::with_id("lte-pki");

    pki.insert(node("root-ca", NodeKind::Authority, "root-ca").with_path_limit(4))?;
    pki.insert(node("core-ca", NodeKind::Authority, "root-ca"))?;
    pki.insert(node("enode-ca", NodeKind::Authority, "root-ca"))?;
    for user in ["mme", "msc", "sgsn", "hss"] {
        pki.insert(node(user, NodeKind::EndEntity, "core-ca"))?;
    }
    for (ca, enbs) in [
        ("alu-ca", &["alu-enb1", "alu-enb2", "alu-enb3"][..]),
        ("huawei-ca", &["huawei-enb1", "huawei-enb2", "huawei-enb3"][..]),
        ("xp-ca", &["xp-enb1", "xp-enb2"][..]),
    ] {
        pki.insert(node(ca, NodeKind::Authority, "enode-ca"))?;
        for enb in enbs {
            pki.insert(node(enb, NodeKind::EndEntity, ca))?;
        }
    }
    println!("{} nodes inserted", pki.len());

    println!("\nGenerating everything, bundles included...");
    let engine = RcgenEngine::default();
    let lifecycle = Lifecycle::new(&engine);
    let report = lifecycle.batch_generate(
        &mut pki,
        &BatchOptions::default().with_workers(4).with_bundles(true),
    )?;
    println!(
        "{} steps completed, {} failures",
        report.completed.len(),
        report.failures.len()
    );

    let issuer = pki
        .get("xp-ca")
        .map(|n| n.issuer_id().to_string())
        .unwrap_or_default();
    println!("\nRevoking xp-ca and its subtree...");
    let report = lifecycle.revoke(&mut pki, "xp-ca", RevocationReason::CessationOfOperation, true)?;
    for (id, step) in &report.completed {
        println!("  {} {}", step, id);
    }

    if let Some(list) = pki.get(&issuer).and_then(|n| n.artifacts().revocation_list.clone()) {
        let path = format!("{}.crl.pem", issuer);
        engine.save_artifact(&list, &path)?;
        println!("\nRevocation list of {} written to {}", issuer, path);
    }

    println!("\nTrust chain of xp-enb1: {}", pki.trust_chain("xp-enb1").join(" -> "));
    std::fs::write("lte-pki.json", pki.serialize()?)?;
    println!("Hierarchy snapshot written to lte-pki.json");

    Ok(())
}
