use shaker_cli::input::Input;
use shaker_cli::runner::Runner;

const IDENTIFICATIONS: &str = r#"{
    "proteins": [
        { "accession": "sp|P1", "gene": "G1" },
        { "accession": "sp|P2", "gene": "G1" },
        { "accession": "rev_sp|P1" }
    ],
    "peptides": [
        { "sequence": "ELVISK", "proteins": [{ "accession": "sp|P1", "position": 4 }, { "accession": "sp|P2", "position": 9 }] },
        { "sequence": "PESTKR", "proteins": [{ "accession": "sp|P1", "position": 20 }] },
        { "sequence": "KSIVLE", "proteins": [{ "accession": "rev_sp|P1", "position": 4 }] }
    ],
    "spectra": [
        {
            "key": "run.1",
            "assumptions": [
                { "engine": "sage", "rank": 1, "peptide": { "sequence": "ELVISK" }, "charge": 2, "score": 40.0, "pep": 0.001 },
                { "engine": "comet", "rank": 1, "peptide": { "sequence": "ELVISK" }, "charge": 2, "score": 3.1, "pep": 0.01 }
            ]
        },
        {
            "key": "run.2",
            "coverage": { "PESTKR": 4 },
            "assumptions": [
                {
                    "engine": "sage",
                    "rank": 1,
                    "peptide": { "sequence": "PESTKR", "modifications": [{ "name": "Phospho", "mass": 79.966331, "site": 3 }] },
                    "charge": 2,
                    "score": 25.0,
                    "pep": 0.02
                }
            ]
        },
        {
            "key": "run.3",
            "assumptions": [
                { "engine": "sage", "rank": 1, "peptide": { "sequence": "KSIVLE" }, "charge": 3, "score": 12.0, "pep": 0.6 }
            ]
        }
    ]
}"#;

#[test]
fn integration() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("shaker-cli-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let identifications = dir.join("identifications.json");
    std::fs::write(&identifications, IDENTIFICATIONS)?;

    let parameters = serde_json::json!({
        "identifications": identifications,
        "output_directory": dir.join("out"),
        "validation": {
            "modifications": [{ "name": "Phospho", "mass": 79.966331, "residues": "STY" }]
        }
    });
    let parameters_path = dir.join("parameters.json");
    std::fs::write(&parameters_path, serde_json::to_vec(&parameters)?)?;

    let settings = Input::load(parameters_path.to_string_lossy())?.build()?;
    let runner = Runner::new(settings)?;
    let report = runner.run(false)?;

    assert_eq!(report.n_unassigned, 0);
    assert_eq!(report.psm.as_ref().map(|l| l.n_matches), Some(3));

    let out = dir.join("out");
    for file in ["psms.tsv", "peptides.tsv", "proteins.tsv", "results.json"] {
        assert!(out.join(file).exists(), "missing {}", file);
    }

    let psms = std::fs::read_to_string(out.join("psms.tsv"))?;
    let lines = psms.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("spectrum\tpeptide\tcharge\tengines"));
    assert!(lines.iter().any(|l| l.starts_with("run.1\tELVISK\t2\tcomet;sage")));

    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("results.json"))?)?;
    assert_eq!(results["output_paths"].as_array().map(|a| a.len()), Some(4));
    assert!(results["report"]["warnings"].is_array());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
