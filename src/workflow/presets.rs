//! Concrete workflow definitions for the three supported targets.
//!
//! Selectors follow the targets as they are today and will need updating
//! when the vendors change their pages.

use std::path::{Path, PathBuf};

use super::{Credentials, ExportMethod, FormWorkflow, IdentifierFormat, LoginSpec, Submit};
use crate::captcha::CaptchaGate;
use crate::config::Timings;
use crate::executor::Step;
use crate::locator::Locator;
use crate::popup::{legacy_signatures, web_signatures, PopupScanner};
use crate::staging::OutputNaming;

pub const SIMPLES_NACIONAL_URL: &str =
    "https://consopt.www8.receita.fazenda.gov.br/consultaoptantes";
pub const LEGACY_WINDOW_TITLE: &str = r"^Comércio";
pub const DISPATCH_COOKIE_FILE: &str = "dispatch_session.json";

/// Federal "Simples Nacional" optant lookup: CNPJ, captcha, print result.
pub fn simples_nacional(timings: &Timings, naming: OutputNaming) -> FormWorkflow {
    FormWorkflow::new(
        "simples-nacional",
        Locator::id("Cnpj"),
        Submit::Click(Locator::css(
            "button[type='submit'].btn-verde, #consultarForm button[type='submit']",
        )),
        Locator::text("Situação no Simples Nacional"),
        PopupScanner::with_timings(web_signatures(), timings),
    )
    .with_entry(SIMPLES_NACIONAL_URL)
    .with_identifier_format(IdentifierFormat::DigitsOnly)
    .with_captcha(CaptchaGate {
        challenge: Locator::css(
            "iframe[src*='hcaptcha'], iframe[src*='recaptcha'], .h-captcha, .g-recaptcha",
        ),
        // Solved state lives in hidden response fields, read as a token.
        solved: None,
    })
    .with_failure(Locator::text("CNPJ inválido"), "CNPJ inválido")
    .with_failure(
        Locator::text("não encontrado"),
        "CNPJ não encontrado na base do Simples Nacional",
    )
    .with_export(ExportMethod::PrintPage)
    .with_naming(naming)
}

/// Document-dispatch portal: login once, then issue and download one
/// document per registration number.
pub fn dispatch_portal(
    base_url: &str,
    credentials: Credentials,
    cookie_dir: &Path,
    timings: &Timings,
    naming: OutputNaming,
) -> FormWorkflow {
    let base = base_url.trim_end_matches('/');
    let login = LoginSpec {
        url: format!("{}/login", base),
        username_field: Locator::css("input[name='usuario'], input#username"),
        password_field: Locator::css("input[name='senha'], input#password"),
        submit: Locator::css("button[type='submit'], input[type='submit']"),
        logged_in: Locator::css("a[href*='logout'], #menu-usuario"),
        credentials,
        cookie_file: Some(cookie_dir.join(DISPATCH_COOKIE_FILE)),
    };

    FormWorkflow::new(
        "dispatch-portal",
        Locator::css("input[name='inscricao'], #inscricaoMunicipal"),
        Submit::Click(Locator::css("#btnPesquisar, button.pesquisar")),
        Locator::css("#btnEmitir, a.emitir-documento"),
        PopupScanner::with_timings(web_signatures(), timings),
    )
    .with_entry(&format!("{}/documentos/emissao", base))
    .with_login(login)
    .with_identifier_format(IdentifierFormat::DigitsOnly)
    .with_step(Step::wait_visible(
        "formulário de emissão",
        Locator::css("input[name='inscricao'], #inscricaoMunicipal"),
    ))
    .with_failure(Locator::text("Inscrição não encontrada"), "Inscrição não encontrada")
    .with_failure(Locator::text("possui pendências"), "Contribuinte com pendências")
    .with_export(ExportMethod::Download(vec![Step::click(
        "emitir",
        Locator::css("#btnEmitir, a.emitir-documento"),
    )]))
    .with_naming(naming)
}

/// Legacy "Comércio" desktop application: type the registration into the
/// search field, open the report and print it to PDF.
pub fn legacy_comercio(
    assets_dir: &Path,
    timings: &Timings,
    naming: OutputNaming,
) -> FormWorkflow {
    let asset = |name: &str| -> PathBuf { assets_dir.join(name) };

    FormWorkflow::new(
        "legacy-comercio",
        Locator::id("edtInscricao"),
        Submit::Keys("{ENTER}".to_string()),
        Locator::image(asset("relatorio_aberto.png")),
        PopupScanner::with_timings(legacy_signatures(), timings),
    )
    .with_entry("main window")
    .with_step(Step::click("menu consulta", Locator::image(asset("menu_consulta.png"))))
    .with_failure(Locator::text("não cadastrad"), "Inscrição não cadastrada")
    .with_failure(Locator::text("Registro não encontrado"), "Registro não encontrado")
    .with_export(ExportMethod::PrintDialog {
        open_keys: "^p".to_string(),
        print_dialog_title: Some("Imprimir".to_string()),
        save_dialog_title: "Salvar Saída de Impressão como".to_string(),
        file_field: Locator::id("1001"),
    })
    .with_naming(naming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::NamingPolicy;

    #[test]
    fn test_simples_nacional_prints_page() {
        let workflow = simples_nacional(&Timings::default(), OutputNaming::default());
        assert_eq!(workflow.export, ExportMethod::PrintPage);
        let gate = workflow.captcha.as_ref().unwrap();
        assert!(gate.solved.is_none());
        assert_eq!(workflow.identifier_format.apply("11.222.333/0001-81"), "11222333000181");
    }

    #[test]
    fn test_dispatch_portal_urls_and_cookie_file() {
        let workflow = dispatch_portal(
            "https://portal.example.gov.br/",
            Credentials {
                username: "u".into(),
                password: "p".into(),
            },
            Path::new("/tmp/cookies"),
            &Timings::default(),
            OutputNaming::new(NamingPolicy::Identifier, ""),
        );
        let login = workflow.login.as_ref().unwrap();
        assert_eq!(login.url, "https://portal.example.gov.br/login");
        assert_eq!(
            login.cookie_file.as_deref(),
            Some(Path::new("/tmp/cookies/dispatch_session.json"))
        );
        assert_eq!(
            workflow.entry.as_deref(),
            Some("https://portal.example.gov.br/documentos/emissao")
        );
    }

    #[test]
    fn test_legacy_uses_assets_dir() {
        let workflow = legacy_comercio(
            Path::new("assets"),
            &Timings::default(),
            OutputNaming::default(),
        );
        assert_eq!(workflow.success, Locator::image("assets/relatorio_aberto.png"));
        assert!(workflow
            .popups
            .signatures()
            .iter()
            .any(|s| s.title == "Salvar Saída de Impressão como" && s.dismiss_keys == "{ESC}"));
    }
}
